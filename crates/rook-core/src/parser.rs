//! Command parser: raw text or structured interaction payloads into a
//! resolved command plus typed arguments.
//!
//! Both front-ends resolve against the same command table and bind with the
//! same converters. Binding is all-or-nothing: a handler never sees a partial
//! `Args`.

use std::sync::Arc;

use crate::{
    command::{normalize_name, Args, Command, Param, ParamDefault},
    errors::ParseError,
    events::{IncomingInteraction, InteractionOption},
};

/// Longest qualified name tried during resolution (`"a b c"`).
pub const MAX_NAME_DEPTH: usize = 3;

/// Read access to the live command table.
pub trait CommandLookup {
    /// Canonical name first, then aliases.
    fn find(&self, name: &str) -> Option<Arc<Command>>;
}

/// A successfully resolved and bound command.
#[derive(Clone, Debug)]
pub struct Parsed {
    pub command: Arc<Command>,
    pub invoked_with: String,
    pub prefix: Option<String>,
    pub args: Args,
}

/// A command-shaped input that failed to parse.
#[derive(Clone, Debug)]
pub struct ParseFailure {
    /// Set once resolution succeeded (the failure is in argument binding).
    pub command: Option<Arc<Command>>,
    pub invoked_with: String,
    pub error: ParseError,
}

/// Split off the longest matching prefix. `None` if the text is not command-shaped.
pub fn strip_prefix<'a>(content: &'a str, prefixes: &[String]) -> Option<(String, &'a str)> {
    let mut sorted: Vec<&String> = prefixes.iter().filter(|p| !p.is_empty()).collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.len()));

    for prefix in sorted {
        if let Some(rest) = content.strip_prefix(prefix.as_str()) {
            // "? ping" is not an invocation.
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return None;
            }
            return Some((prefix.clone(), rest));
        }
    }
    None
}

/// Parse a text message. `None` when the message is not command-shaped.
pub fn parse_text(
    content: &str,
    prefixes: &[String],
    lookup: &dyn CommandLookup,
) -> Option<Result<Parsed, ParseFailure>> {
    let (prefix, rest) = strip_prefix(content, prefixes)?;
    Some(parse_invocation(rest, lookup).map(|mut parsed| {
        parsed.prefix = Some(prefix);
        parsed
    }))
}

/// Resolve a command name at the start of `input` (greedy over qualified
/// names) and bind the remainder.
pub fn parse_invocation(input: &str, lookup: &dyn CommandLookup) -> Result<Parsed, ParseFailure> {
    let (command, invoked_with, consumed) = resolve(input, lookup)?;

    let args = bind_text(&command, &input[consumed..]).map_err(|error| ParseFailure {
        command: Some(command.clone()),
        invoked_with: invoked_with.clone(),
        error,
    })?;

    Ok(Parsed {
        command,
        invoked_with,
        prefix: None,
        args,
    })
}

/// Returns the command, the name as typed, and the byte offset after the name.
fn resolve(
    input: &str,
    lookup: &dyn CommandLookup,
) -> Result<(Arc<Command>, String, usize), ParseFailure> {
    let mut cur = Cursor::new(input);
    let mut words: Vec<(&str, usize)> = Vec::with_capacity(MAX_NAME_DEPTH);
    while words.len() < MAX_NAME_DEPTH {
        match cur.next_word() {
            Some(w) => words.push((w, cur.pos)),
            None => break,
        }
    }

    let Some(&(first, _)) = words.first() else {
        return Err(ParseFailure {
            command: None,
            invoked_with: String::new(),
            error: ParseError::CommandNotFound(String::new()),
        });
    };

    for n in (1..=words.len()).rev() {
        let candidate = words[..n]
            .iter()
            .map(|(w, _)| *w)
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(cmd) = lookup.find(&candidate) {
            return Ok((cmd, candidate, words[n - 1].1));
        }
    }

    Err(ParseFailure {
        command: None,
        invoked_with: first.to_string(),
        error: ParseError::CommandNotFound(first.to_string()),
    })
}

/// Bind raw argument text against the command's schema, left to right.
pub fn bind_text(command: &Command, input: &str) -> Result<Args, ParseError> {
    let mut cur = Cursor::new(input);
    let mut args = Args::new();

    for param in command.params() {
        let raw = if param.is_rest() {
            let rest = cur.rest();
            (!rest.is_empty()).then(|| rest.to_string())
        } else {
            cur.next_token().map_err(|reason| bad_argument(param, reason))?
        };

        match raw {
            Some(raw) => {
                let converter = param
                    .converter()
                    .ok_or_else(|| bad_argument(param, "no converter bound"))?;
                let value = converter
                    .convert(&raw)
                    .map_err(|reason| bad_argument(param, reason))?;
                args.insert(param.name(), value);
            }
            None => bind_absent(param, &mut args)?,
        }
    }

    // Surplus tokens after the last parameter are ignored.
    Ok(args)
}

/// Bind structured options by parameter name.
pub fn bind_options(command: &Command, options: &[InteractionOption]) -> Result<Args, ParseError> {
    let mut args = Args::new();

    for param in command.params() {
        match options.iter().find(|o| o.name == param.name()) {
            Some(option) => {
                let converter = param
                    .converter()
                    .ok_or_else(|| bad_argument(param, "no converter bound"))?;
                let value = converter
                    .convert_option(&option.value)
                    .map_err(|reason| bad_argument(param, reason))?;
                args.insert(param.name(), value);
            }
            None => bind_absent(param, &mut args)?,
        }
    }

    Ok(args)
}

/// Resolve and bind a structured (slash) invocation.
pub fn parse_interaction(
    interaction: &IncomingInteraction,
    lookup: &dyn CommandLookup,
) -> Result<Parsed, ParseFailure> {
    let name = normalize_name(&interaction.command);
    let Some(command) = lookup.find(&name) else {
        return Err(ParseFailure {
            command: None,
            invoked_with: name.clone(),
            error: ParseError::CommandNotFound(name),
        });
    };

    let args = bind_options(&command, &interaction.options).map_err(|error| ParseFailure {
        command: Some(command.clone()),
        invoked_with: name.clone(),
        error,
    })?;

    Ok(Parsed {
        command,
        invoked_with: name,
        prefix: None,
        args,
    })
}

fn bind_absent(param: &Param, args: &mut Args) -> Result<(), ParseError> {
    match &param.default {
        ParamDefault::Required => Err(ParseError::MissingRequiredArgument(
            param.name().to_string(),
        )),
        ParamDefault::Optional => Ok(()),
        ParamDefault::Value(v) => {
            args.insert(param.name(), v.clone());
            Ok(())
        }
    }
}

fn bad_argument(param: &Param, reason: impl Into<String>) -> ParseError {
    ParseError::ArgumentParsing {
        parameter: param.name().to_string(),
        reason: reason.into(),
    }
}

/// Whitespace / quote aware reader over the argument text.
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn skip_ws(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// Next whitespace-delimited word, no quote handling.
    fn next_word(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        self.pos += end;
        Some(&rest[..end])
    }

    /// Next argument token; `"double quoted"` tokens may contain whitespace
    /// and `\"` escapes.
    fn next_token(&mut self) -> Result<Option<String>, &'static str> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        if !rest.starts_with('"') {
            return Ok(self.next_word().map(str::to_string));
        }

        let mut out = String::new();
        let mut escaped = false;
        for (idx, ch) in rest.char_indices().skip(1) {
            if escaped {
                if ch != '"' && ch != '\\' {
                    out.push('\\');
                }
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => {
                    let after = &rest[idx + 1..];
                    if !after.is_empty() && !after.starts_with(char::is_whitespace) {
                        return Err("expected space after closing quote");
                    }
                    self.pos += idx + 1;
                    return Ok(Some(out));
                }
                _ => out.push(ch),
            }
        }
        Err("expected closing quote")
    }

    fn rest(&mut self) -> &'a str {
        self.skip_ws();
        let rest = self.src[self.pos..].trim_end();
        self.pos = self.src.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        command::handler_fn,
        convert::{ArgValue, Integer, Text},
        domain::{ChannelId, UserId},
        events::OptionValue,
    };

    struct Table(HashMap<String, Arc<Command>>);

    impl CommandLookup for Table {
        fn find(&self, name: &str) -> Option<Arc<Command>> {
            self.0.get(name).cloned()
        }
    }

    fn cmd(name: &str, params: Vec<Param>) -> Arc<Command> {
        let mut b = Command::builder(
            name,
            handler_fn(|_ctx| Box::pin(async { Ok::<(), crate::Error>(()) })),
        );
        for p in params {
            b = b.param(p);
        }
        Arc::new(b.build().unwrap())
    }

    fn table(cmds: Vec<Arc<Command>>) -> Table {
        Table(
            cmds.into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect(),
        )
    }

    fn widget() -> Arc<Command> {
        cmd(
            "widget",
            vec![
                Param::new("name", Text),
                Param::new("count", Integer).with_default(ArgValue::Integer(1)),
            ],
        )
    }

    #[test]
    fn optional_parameter_takes_given_value_or_default() {
        let c = widget();

        let args = bind_text(&c, "widget 3").unwrap();
        assert_eq!(args.text("name"), Some("widget"));
        assert_eq!(args.integer("count"), Some(3));

        let args = bind_text(&c, "widget").unwrap();
        assert_eq!(args.text("name"), Some("widget"));
        assert_eq!(args.integer("count"), Some(1));
    }

    #[test]
    fn failed_conversion_fails_whole_parse() {
        let c = cmd("count", vec![Param::new("count", Integer)]);
        match bind_text(&c, "abc").unwrap_err() {
            ParseError::ArgumentParsing { parameter, .. } => assert_eq!(parameter, "count"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_required_argument() {
        let c = widget();
        assert_eq!(
            bind_text(&c, "   ").unwrap_err(),
            ParseError::MissingRequiredArgument("name".to_string())
        );
    }

    #[test]
    fn rest_parameter_keeps_inner_whitespace() {
        let c = cmd(
            "say",
            vec![
                Param::new("times", Integer),
                Param::new("text", Text).rest(),
            ],
        );
        let args = bind_text(&c, " 2   hello   there  world ").unwrap();
        assert_eq!(args.integer("times"), Some(2));
        assert_eq!(args.text("text"), Some("hello   there  world"));
    }

    #[test]
    fn quoted_tokens() {
        let c = cmd(
            "tag",
            vec![Param::new("name", Text), Param::new("content", Text)],
        );
        let args = bind_text(&c, r#""hello world" "say \"hi\"""#).unwrap();
        assert_eq!(args.text("name"), Some("hello world"));
        assert_eq!(args.text("content"), Some(r#"say "hi""#));

        let err = bind_text(&c, r#"ok "never closed"#).unwrap_err();
        assert_eq!(
            err,
            ParseError::ArgumentParsing {
                parameter: "content".to_string(),
                reason: "expected closing quote".to_string(),
            }
        );
    }

    #[test]
    fn prefixes_longest_first_and_no_space_after() {
        let prefixes = vec!["?".to_string(), "??".to_string()];
        assert_eq!(
            strip_prefix("??ping", &prefixes),
            Some(("??".to_string(), "ping"))
        );
        assert_eq!(strip_prefix("? ping", &prefixes), None);
        assert_eq!(strip_prefix("hello", &prefixes), None);
        assert_eq!(strip_prefix("?", &prefixes), None);
    }

    #[test]
    fn qualified_names_resolve_greedily() {
        let t = table(vec![
            cmd("reminders", vec![]),
            cmd("reminders cancel", vec![Param::new("id", Integer)]),
        ]);
        let prefixes = vec!["?".to_string()];

        let parsed = parse_text("?reminders cancel 12", &prefixes, &t)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.command.name(), "reminders cancel");
        assert_eq!(parsed.args.integer("id"), Some(12));
        assert_eq!(parsed.prefix.as_deref(), Some("?"));

        let parsed = parse_text("?reminders", &prefixes, &t).unwrap().unwrap();
        assert_eq!(parsed.command.name(), "reminders");

        let failure = parse_text("?nope 1", &prefixes, &t).unwrap().unwrap_err();
        assert_eq!(failure.error, ParseError::CommandNotFound("nope".to_string()));
        assert!(failure.command.is_none());

        assert!(parse_text("just chatting", &prefixes, &t).is_none());
    }

    #[test]
    fn interaction_options_bind_by_name() {
        let t = table(vec![widget()]);
        let interaction = IncomingInteraction {
            id: crate::domain::InteractionId(1),
            token: "tok".to_string(),
            channel_id: ChannelId(2),
            guild_id: None,
            user: crate::domain::Actor {
                id: UserId(3),
                name: "u".to_string(),
                bot: false,
            },
            command: "widget".to_string(),
            options: vec![
                InteractionOption {
                    name: "count".to_string(),
                    value: OptionValue::Integer(4),
                },
                InteractionOption {
                    name: "name".to_string(),
                    value: OptionValue::String("bolt".to_string()),
                },
            ],
            nsfw_channel: false,
            member_permissions: None,
        };

        let parsed = parse_interaction(&interaction, &t).unwrap();
        assert_eq!(parsed.args.text("name"), Some("bolt"));
        assert_eq!(parsed.args.integer("count"), Some(4));
        assert!(parsed.prefix.is_none());
    }
}
