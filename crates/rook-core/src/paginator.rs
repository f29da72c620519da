//! Splitting long output into message-sized pages.

use std::fmt::Display;

/// Discord's message content limit.
pub const MESSAGE_LIMIT: usize = 2000;

/// Packs lines into pages no longer than `max_size`, each wrapped in
/// `prefix`/`suffix` (a code fence by default).
#[derive(Clone, Debug)]
pub struct LinePaginator {
    prefix: String,
    suffix: String,
    max_size: usize,
    lines: Vec<String>,
    /// Length of `lines` including one separator per line.
    current_len: usize,
    pages: Vec<String>,
}

impl Default for LinePaginator {
    fn default() -> Self {
        Self::new("```", "```", MESSAGE_LIMIT)
    }
}

impl LinePaginator {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>, max_size: usize) -> Self {
        let mut p = Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            max_size,
            lines: Vec::new(),
            current_len: 0,
            pages: Vec::new(),
        };
        // Always leave room for at least one character of content.
        p.max_size = p.max_size.max(p.overhead() + 1);
        p
    }

    pub fn from_text(text: &str, prefix: &str, suffix: &str, max_size: usize) -> Self {
        let mut p = Self::new(prefix, suffix, max_size);
        for line in text.split('\n') {
            p.add_line(line);
        }
        p
    }

    fn overhead(&self) -> usize {
        let wrap = |s: &str| if s.is_empty() { 0 } else { s.len() + 1 };
        wrap(&self.prefix) + wrap(&self.suffix)
    }

    fn budget(&self) -> usize {
        self.max_size - self.overhead()
    }

    /// Lines longer than a page are hard-wrapped at character boundaries.
    pub fn add_line(&mut self, line: &str) {
        let budget = self.budget();
        let mut rest = line;
        while rest.len() > budget {
            let mut cut = budget;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            let (head, tail) = rest.split_at(cut);
            self.push_line(head);
            rest = tail;
        }
        self.push_line(rest);
    }

    fn push_line(&mut self, line: &str) {
        if !self.lines.is_empty() && self.current_len + line.len() > self.budget() {
            self.close_page();
        }
        self.current_len += line.len() + 1;
        self.lines.push(line.to_string());
    }

    /// Finish the current page even if it has room left.
    pub fn close_page(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let mut page = String::with_capacity(self.max_size);
        if !self.prefix.is_empty() {
            page.push_str(&self.prefix);
            page.push('\n');
        }
        page.push_str(&self.lines.join("\n"));
        if !self.suffix.is_empty() {
            page.push('\n');
            page.push_str(&self.suffix);
        }
        self.pages.push(page);
        self.lines.clear();
        self.current_len = 0;
    }

    pub fn pages(mut self) -> Vec<String> {
        self.close_page();
        self.pages
    }
}

/// Numbered list entries split into fixed-size pages.
#[derive(Clone, Debug)]
pub struct ListPages<T> {
    entries: Vec<T>,
    per_page: usize,
}

impl<T: Display> ListPages<T> {
    pub fn new(entries: Vec<T>, per_page: usize) -> Self {
        Self {
            entries,
            per_page: per_page.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_pages(&self) -> usize {
        self.entries.len().div_ceil(self.per_page)
    }

    pub fn is_paginating(&self) -> bool {
        self.entries.len() > self.per_page
    }

    pub fn entries(&self, page: usize) -> Option<&[T]> {
        let start = page.checked_mul(self.per_page)?;
        if start >= self.entries.len() {
            return None;
        }
        let end = (start + self.per_page).min(self.entries.len());
        Some(&self.entries[start..end])
    }

    /// `"1. entry"` lines for `page` (zero-based).
    pub fn render(&self, page: usize) -> Option<String> {
        let entries = self.entries(page)?;
        let first = page * self.per_page + 1;
        Some(
            entries
                .iter()
                .enumerate()
                .map(|(i, e)| format!("{}. {e}", first + i))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Shown only when there is more than one page.
    pub fn footer(&self, page: usize) -> Option<String> {
        let max = self.max_pages();
        (max > 1).then(|| format!("Page {}/{max} ({} entries)", page + 1, self.entries.len()))
    }
}

/// Which navigation controls to disable for the current page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Controls {
    pub first: bool,
    pub previous: bool,
    pub next: bool,
    pub last: bool,
}

/// Current position in a paginated view. All moves are bounds-checked and
/// leave the cursor unchanged when out of range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageCursor {
    page: usize,
    max_pages: Option<usize>,
}

impl PageCursor {
    /// `max_pages` is `None` for open-ended sources.
    pub fn new(max_pages: Option<usize>) -> Self {
        Self { page: 0, max_pages }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    /// First/last jumps only make sense for known sizes of two or more.
    pub fn shows_first_last(&self) -> bool {
        self.max_pages.is_some_and(|m| m >= 2)
    }

    /// Move to a zero-based page. Returns whether the move happened.
    pub fn goto(&mut self, page: usize) -> bool {
        let in_range = match self.max_pages {
            Some(max) => page < max,
            None => true,
        };
        if in_range {
            self.page = page;
        }
        in_range
    }

    /// Move to a one-based page number as a user would type it.
    pub fn goto_number(&mut self, number: &str) -> Result<usize, String> {
        let n: usize = number
            .trim()
            .parse()
            .map_err(|_| format!("Expected a number not {number:?}"))?;
        if n == 0 || !self.goto(n - 1) {
            return Err(match self.max_pages {
                Some(max) => format!("Expected a number between 1 and {max}"),
                None => "Expected a positive number".to_string(),
            });
        }
        Ok(self.page)
    }

    pub fn first(&mut self) -> bool {
        self.goto(0)
    }

    pub fn previous(&mut self) -> bool {
        self.page.checked_sub(1).is_some_and(|p| self.goto(p))
    }

    pub fn next(&mut self) -> bool {
        self.goto(self.page + 1)
    }

    pub fn last(&mut self) -> bool {
        match self.max_pages {
            Some(max) if max > 0 => self.goto(max - 1),
            _ => false,
        }
    }

    pub fn disabled(&self) -> Controls {
        let at_end = self.max_pages.is_some_and(|m| self.page + 1 >= m);
        Controls {
            first: self.page == 0,
            previous: self.page == 0,
            next: at_end,
            last: self.max_pages.is_none() || at_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_pages_respect_max_size() {
        let text = (0..50)
            .map(|i| format!("line number {i:02}"))
            .collect::<Vec<_>>()
            .join("\n");
        let pages = LinePaginator::from_text(&text, "```", "```", 100).pages();

        assert!(pages.len() > 1);
        for page in &pages {
            assert!(page.len() <= 100, "{} > 100", page.len());
            assert!(page.starts_with("```\n") && page.ends_with("\n```"));
        }
        let rejoined: Vec<&str> = pages
            .iter()
            .flat_map(|p| p.lines().filter(|l| *l != "```"))
            .collect();
        assert_eq!(rejoined.len(), 50);
        assert_eq!(rejoined[49], "line number 49");
    }

    #[test]
    fn overlong_lines_are_wrapped() {
        let mut p = LinePaginator::new("", "", 10);
        p.add_line("ééééééééé"); // 18 bytes
        let pages = p.pages();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|pg| pg.len() <= 10));
        assert_eq!(pages.concat(), "ééééééééé");
    }

    #[test]
    fn list_pages_number_entries_and_footer() {
        let pages = ListPages::new((1..=25).map(|i| format!("item {i}")).collect(), 10);
        assert_eq!(pages.max_pages(), 3);
        assert!(pages.is_paginating());

        let second = pages.render(1).unwrap();
        assert!(second.starts_with("11. item 11"));
        assert!(second.ends_with("20. item 20"));
        assert_eq!(pages.render(2).unwrap().lines().count(), 5);
        assert!(pages.render(3).is_none());
        assert_eq!(pages.footer(1).as_deref(), Some("Page 2/3 (25 entries)"));

        let single = ListPages::new(vec!["only"], 10);
        assert_eq!(single.footer(0), None);
    }

    #[test]
    fn cursor_navigation_is_checked() {
        let mut c = PageCursor::new(Some(3));
        assert_eq!(
            c.disabled(),
            Controls {
                first: true,
                previous: true,
                next: false,
                last: false
            }
        );
        assert!(!c.previous());
        assert!(c.next() && c.next());
        assert!(!c.next());
        assert_eq!(c.page(), 2);
        assert!(c.disabled().next && c.disabled().last);

        assert!(c.first());
        assert!(c.last());
        assert_eq!(c.page(), 2);

        assert_eq!(c.goto_number("2"), Ok(1));
        assert_eq!(c.goto_number("9"), Err("Expected a number between 1 and 3".into()));
        assert!(c.goto_number("two").is_err());
        assert_eq!(c.page(), 1);

        let open = PageCursor::new(None);
        assert!(!open.shows_first_last());
        assert!(open.disabled().last);
    }
}
