use std::time::Duration;

/// `"3d 4h"`, `"12m 5s"`: the two largest non-zero units.
pub fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    let units = [
        (secs / 86_400, "d"),
        ((secs % 86_400) / 3_600, "h"),
        ((secs % 3_600) / 60, "m"),
        (secs % 60, "s"),
    ];
    let parts: Vec<String> = units
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .take(2)
        .filter(|(n, _)| *n > 0)
        .map(|(n, u)| format!("{n}{u}"))
        .collect();
    if parts.is_empty() {
        return "0s".to_string();
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_two_largest_units() {
        assert_eq!(humanize(Duration::from_secs(0)), "0s");
        assert_eq!(humanize(Duration::from_secs(59)), "59s");
        assert_eq!(humanize(Duration::from_secs(3_600 + 61)), "1h 1m");
        assert_eq!(humanize(Duration::from_secs(86_400 + 30)), "1d");
        assert_eq!(humanize(Duration::from_secs(2 * 86_400 + 5 * 3_600 + 7)), "2d 5h");
    }
}
