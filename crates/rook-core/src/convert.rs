//! Argument converters.
//!
//! Every parameter declares a converter; parsing raw text (or a structured
//! interaction option) into a typed [`ArgValue`] goes through it.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::Duration,
};

use regex::Regex;

use crate::{
    domain::{ChannelId, RoleId, UserId},
    events::OptionValue,
};

/// A converted argument.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Duration(Duration),
    Snowflake(u64),
    User(UserId),
    Channel(ChannelId),
    Role(RoleId),
}

impl ArgValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_snowflake(&self) -> Option<u64> {
        match self {
            Self::Snowflake(id) => Some(*id),
            Self::User(u) => Some(u.0),
            Self::Channel(c) => Some(c.0),
            Self::Role(r) => Some(r.0),
            _ => None,
        }
    }
}

/// Pluggable conversion for one parameter type.
///
/// `Err` carries the human-readable reason; the parser attaches the parameter name.
pub trait Converter: Send + Sync {
    /// Type name shown in usage strings.
    fn type_name(&self) -> &str;

    fn convert(&self, raw: &str) -> Result<ArgValue, String>;

    /// Convert a structured option. Defaults to the textual form.
    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        self.convert(&value.as_raw())
    }
}

pub struct Text;

impl Converter for Text {
    fn type_name(&self) -> &str {
        "text"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        Ok(ArgValue::Text(raw.to_string()))
    }
}

pub struct Integer;

impl Converter for Integer {
    fn type_name(&self) -> &str {
        "integer"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        raw.trim()
            .parse::<i64>()
            .map(ArgValue::Integer)
            .map_err(|_| format!("expected a whole number not {raw:?}"))
    }

    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        match value {
            OptionValue::Integer(i) => Ok(ArgValue::Integer(*i)),
            other => self.convert(&other.as_raw()),
        }
    }
}

pub struct Number;

impl Converter for Number {
    fn type_name(&self) -> &str {
        "number"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(ArgValue::Number(n)),
            _ => Err(format!("expected a number not {raw:?}")),
        }
    }

    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        match value {
            OptionValue::Number(n) => Ok(ArgValue::Number(*n)),
            OptionValue::Integer(i) => Ok(ArgValue::Number(*i as f64)),
            other => self.convert(&other.as_raw()),
        }
    }
}

pub struct Boolean;

impl Converter for Boolean {
    fn type_name(&self) -> &str {
        "boolean"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        match raw.trim().to_lowercase().as_str() {
            "yes" | "y" | "true" | "t" | "1" | "on" | "enable" => Ok(ArgValue::Boolean(true)),
            "no" | "n" | "false" | "f" | "0" | "off" | "disable" => Ok(ArgValue::Boolean(false)),
            _ => Err(format!("{raw:?} is not a recognised boolean option")),
        }
    }

    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        match value {
            OptionValue::Boolean(b) => Ok(ArgValue::Boolean(*b)),
            other => self.convert(&other.as_raw()),
        }
    }
}

/// Compact durations: `90s`, `1h30m`, `2 days`, `1w 2d`.
pub struct DurationArg;

impl Converter for DurationArg {
    fn type_name(&self) -> &str {
        "duration"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        parse_duration(raw)
            .map(ArgValue::Duration)
            .ok_or_else(|| format!("{raw:?} is not a duration like 10m or 1h30m"))
    }
}

/// A raw numeric id.
pub struct Snowflake;

impl Converter for Snowflake {
    fn type_name(&self) -> &str {
        "id"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        raw.trim()
            .parse::<u64>()
            .map(ArgValue::Snowflake)
            .map_err(|_| format!("expected a Discord ID not {raw:?}"))
    }
}

/// A user mention (`<@id>`, `<@!id>`) or raw id.
pub struct UserRef;

impl Converter for UserRef {
    fn type_name(&self) -> &str {
        "user"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        mention_id(raw, user_mention_re())
            .map(|id| ArgValue::User(UserId(id)))
            .ok_or_else(|| format!("user {raw:?} not found"))
    }

    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        match value {
            OptionValue::User(u) => Ok(ArgValue::User(*u)),
            other => self.convert(&other.as_raw()),
        }
    }
}

/// A channel mention (`<#id>`) or raw id.
pub struct ChannelRef;

impl Converter for ChannelRef {
    fn type_name(&self) -> &str {
        "channel"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        mention_id(raw, channel_mention_re())
            .map(|id| ArgValue::Channel(ChannelId(id)))
            .ok_or_else(|| format!("channel {raw:?} not found"))
    }

    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        match value {
            OptionValue::Channel(c) => Ok(ArgValue::Channel(*c)),
            other => self.convert(&other.as_raw()),
        }
    }
}

/// A role mention (`<@&id>`) or raw id.
pub struct RoleRef;

impl Converter for RoleRef {
    fn type_name(&self) -> &str {
        "role"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        mention_id(raw, role_mention_re())
            .map(|id| ArgValue::Role(RoleId(id)))
            .ok_or_else(|| format!("role {raw:?} not found"))
    }

    fn convert_option(&self, value: &OptionValue) -> Result<ArgValue, String> {
        match value {
            OptionValue::Role(r) => Ok(ArgValue::Role(*r)),
            other => self.convert(&other.as_raw()),
        }
    }
}

/// Paste id from a pastebin-style URL (`https://mystb.in/SomeWordsHere.rs`) or a bare id.
pub struct PasteId;

impl Converter for PasteId {
    fn type_name(&self) -> &str {
        "paste"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        paste_id(raw)
            .map(ArgValue::Text)
            .ok_or_else(|| "no paste ids found in this text".to_string())
    }
}

/// A reddit submission URL (`https://www.reddit.com/r/<sub>/comments/<id>/...`).
pub struct RedditUrl;

impl Converter for RedditUrl {
    fn type_name(&self) -> &str {
        "reddit url"
    }

    fn convert(&self, raw: &str) -> Result<ArgValue, String> {
        validate_reddit_url(raw).map(ArgValue::Text)
    }
}

/// Converters addressable by type name.
///
/// Built-ins are always present; extensions add their own while loaded.
#[derive(Clone)]
pub struct ConverterTable {
    by_name: HashMap<String, Arc<dyn Converter>>,
}

impl ConverterTable {
    pub fn builtin() -> Self {
        let mut by_name: HashMap<String, Arc<dyn Converter>> = HashMap::new();
        let mut add = |names: &[&str], c: Arc<dyn Converter>| {
            for n in names {
                by_name.insert((*n).to_string(), c.clone());
            }
        };
        add(&["text", "str", "string"], Arc::new(Text));
        add(&["integer", "int"], Arc::new(Integer));
        add(&["number", "float"], Arc::new(Number));
        add(&["boolean", "bool"], Arc::new(Boolean));
        add(&["duration"], Arc::new(DurationArg));
        add(&["snowflake", "id"], Arc::new(Snowflake));
        add(&["user", "member"], Arc::new(UserRef));
        add(&["channel"], Arc::new(ChannelRef));
        add(&["role"], Arc::new(RoleRef));
        add(&["paste_id"], Arc::new(PasteId));
        add(&["reddit_url"], Arc::new(RedditUrl));
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, converter: Arc<dyn Converter>) {
        self.by_name.insert(name.into(), converter);
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Converter>> {
        self.by_name.remove(name)
    }
}

impl Default for ConverterTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ============== Helpers ==============

fn user_mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:<@!?([0-9]{15,20})>|([0-9]{15,20}))$").expect("valid regex"))
}

fn channel_mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:<#([0-9]{15,20})>|([0-9]{15,20}))$").expect("valid regex"))
}

fn role_mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:<@&([0-9]{15,20})>|([0-9]{15,20}))$").expect("valid regex"))
}

fn paste_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:(?:https?://)?(?:beta\.)?mystb\.in/)?(?P<id>(?:[A-Z][a-z]+)+)(?P<ext>\.\w+)?")
            .expect("valid regex")
    })
}

fn reddit_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/r/[A-Za-z0-9_]+/comments/[A-Za-z0-9]+(?:/.*)?$").expect("valid regex")
    })
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*([0-9]+)\s*(weeks?|w|days?|d|hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)",
        )
        .expect("valid regex")
    })
}

fn mention_id(raw: &str, re: &Regex) -> Option<u64> {
    let caps = re.captures(raw.trim())?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

fn unit_seconds(unit: &str) -> u64 {
    match unit.to_lowercase().chars().next() {
        Some('w') => 7 * 86_400,
        Some('d') => 86_400,
        Some('h') => 3_600,
        Some('m') => 60,
        _ => 1,
    }
}

/// Parse a duration at the start of `s`.
///
/// Returns the duration and the number of bytes consumed; `None` when `s` does
/// not start with a duration.
pub fn parse_duration_prefix(s: &str) -> Option<(Duration, usize)> {
    let mut total: u64 = 0;
    let mut consumed = 0usize;
    let mut matched = false;

    while let Some((secs, end)) = duration_component(&s[consumed..]) {
        total = total.checked_add(secs?)?;
        consumed += end;
        matched = true;

        // Allow "1h, 30m" and "1h and 30m" between components.
        let rest = &s[consumed..];
        let trimmed = rest.trim_start_matches([' ', ',']);
        let trimmed = trimmed.strip_prefix("and ").unwrap_or(trimmed);
        if duration_component(trimmed).is_some() {
            consumed += rest.len() - trimmed.len();
        }
    }

    matched.then(|| (Duration::from_secs(total), consumed))
}

/// One `<amount><unit>` component at the start of `s`: its seconds (`None` on
/// overflow) and its end offset. A unit running into more letters (`2months`)
/// is not a component; digits may follow directly (`1h30m`).
fn duration_component(s: &str) -> Option<(Option<u64>, usize)> {
    let caps = duration_re().captures(s)?;
    let end = caps.get(0)?.end();
    if s[end..].starts_with(|c: char| c.is_alphabetic()) {
        return None;
    }
    let secs = caps
        .get(1)?
        .as_str()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit_seconds(caps.get(2)?.as_str())));
    Some((secs, end))
}

/// Parse a string that is entirely a duration.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let (d, used) = parse_duration_prefix(s)?;
    if !s[used..].trim().is_empty() || d.is_zero() {
        return None;
    }
    Some(d)
}

/// Extract a paste id from a URL or text.
pub fn paste_id(raw: &str) -> Option<String> {
    paste_re()
        .captures(raw.trim())
        .and_then(|c| c.name("id"))
        .map(|m| m.as_str().to_string())
}

/// Validate a reddit submission URL; returns the normalised `https://host/path`.
pub fn validate_reddit_url(raw: &str) -> Result<String, String> {
    let raw = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let without_scheme = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .ok_or_else(|| "not a valid URL".to_string())?;

    let (host, path) = match without_scheme.find('/') {
        Some(idx) => (&without_scheme[..idx], &without_scheme[idx..]),
        None => (without_scheme, "/"),
    };
    let path = path.split(['?', '#']).next().unwrap_or("/");

    if host.is_empty() {
        return Err("not a valid URL".to_string());
    }
    let host = host.to_lowercase();
    let is_reddit = host == "reddit.com" || host.ends_with(".reddit.com");
    if !is_reddit || !reddit_path_re().is_match(path) {
        return Err("not a reddit URL".to_string());
    }

    Ok(format!("https://{host}{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_reports_reason() {
        assert_eq!(Integer.convert("42"), Ok(ArgValue::Integer(42)));
        let err = Integer.convert("abc").unwrap_err();
        assert!(err.contains("abc"));
    }

    #[test]
    fn durations_parse_compound_forms() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1h 30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2 days"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("1w, 1d"), Some(Duration::from_secs(691_200)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10m later"), None);
        assert_eq!(parse_duration("0s"), None);
    }

    #[test]
    fn units_may_run_into_digits_but_not_letters() {
        assert_eq!(parse_duration("1min30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2d12h"), Some(Duration::from_secs(216_000)));
        assert_eq!(parse_duration("2months"), None);
        assert_eq!(parse_duration_prefix("5mo later"), None);

        let (d, used) = parse_duration_prefix("1h30m stretch").unwrap();
        assert_eq!(d, Duration::from_secs(5400));
        assert_eq!(&"1h30m stretch"[used..], " stretch");
    }

    #[test]
    fn duration_prefix_stops_at_text() {
        let (d, used) = parse_duration_prefix("10m feed the cat").unwrap();
        assert_eq!(d, Duration::from_secs(600));
        assert_eq!(&"10m feed the cat"[used..], " feed the cat");
        // A word starting with a unit letter is not a unit.
        assert!(parse_duration_prefix("5 mangoes").is_none());
    }

    #[test]
    fn mentions_and_raw_ids() {
        assert_eq!(
            UserRef.convert("<@!175928847299117063>"),
            Ok(ArgValue::User(UserId(175_928_847_299_117_063)))
        );
        assert_eq!(
            ChannelRef.convert("<#175928847299117063>"),
            Ok(ArgValue::Channel(ChannelId(175_928_847_299_117_063)))
        );
        assert_eq!(
            RoleRef.convert("175928847299117063"),
            Ok(ArgValue::Role(RoleId(175_928_847_299_117_063)))
        );
        assert!(UserRef.convert("<#175928847299117063>").is_err());
        assert!(Snowflake
            .convert("nope")
            .unwrap_err()
            .contains("expected a Discord ID"));
    }

    #[test]
    fn paste_ids_from_urls() {
        assert_eq!(
            paste_id("https://mystb.in/ChargesLookingRecipes.python").as_deref(),
            Some("ChargesLookingRecipes")
        );
        assert_eq!(paste_id("SomeWordsHere").as_deref(), Some("SomeWordsHere"));
        assert!(PasteId.convert("1234").is_err());
    }

    #[test]
    fn reddit_urls_are_validated() {
        assert_eq!(
            validate_reddit_url("https://www.reddit.com/r/rust/comments/abc123/some_title/?x=1"),
            Ok("https://www.reddit.com/r/rust/comments/abc123/some_title/".to_string())
        );
        assert!(validate_reddit_url("https://example.com/r/rust/comments/abc123").is_err());
        assert!(validate_reddit_url("https://reddit.com/r/rust").is_err());
        assert!(validate_reddit_url("reddit.com/r/rust/comments/abc").is_err());
    }

    #[test]
    fn table_resolves_builtin_aliases() {
        let table = ConverterTable::builtin();
        assert_eq!(table.get("int").unwrap().type_name(), "integer");
        assert_eq!(table.get("member").unwrap().type_name(), "user");
        assert!(table.get("colour").is_none());
    }

    #[test]
    fn structured_options_skip_text_round_trip() {
        assert_eq!(
            Integer.convert_option(&OptionValue::Integer(7)),
            Ok(ArgValue::Integer(7))
        );
        assert_eq!(
            UserRef.convert_option(&OptionValue::User(UserId(5))),
            Ok(ArgValue::User(UserId(5)))
        );
        assert_eq!(
            Boolean.convert_option(&OptionValue::String("off".to_string())),
            Ok(ArgValue::Boolean(false))
        );
    }
}
