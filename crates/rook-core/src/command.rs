//! Command model: declared parameters, checks, cooldown, handler, and the
//! per-invocation context handed to the handler.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    bot::Services,
    checks::Check,
    convert::{ArgValue, Converter},
    cooldown::CooldownSetting,
    domain::{Actor, ChannelId, GuildId, Permissions, RoleId, UserId},
    errors::ExtensionError,
    messaging::types::{Reply, ReplyTarget},
    registry::ExtensionHandle,
    Result,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Body of a command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap a closure returning a boxed future as a handler.
///
/// ```ignore
/// handler_fn(|ctx| Box::pin(async move { ctx.reply("pong").await }))
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

// ============== Parameters ==============

/// Converter of a parameter: given directly, or by registered type name.
#[derive(Clone)]
pub enum ConverterRef {
    Resolved(Arc<dyn Converter>),
    Named(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamDefault {
    Required,
    /// Absent from [`Args`] when not supplied.
    Optional,
    Value(ArgValue),
}

/// One declared parameter of a command.
#[derive(Clone)]
pub struct Param {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) converter: ConverterRef,
    pub(crate) default: ParamDefault,
    pub(crate) rest: bool,
}

impl Param {
    /// A required parameter converted by `converter`.
    pub fn new(name: impl Into<String>, converter: impl Converter + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            converter: ConverterRef::Resolved(Arc::new(converter)),
            default: ParamDefault::Required,
            rest: false,
        }
    }

    /// A required parameter whose converter is looked up by type name at load time.
    pub fn named(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            converter: ConverterRef::Named(type_name.into()),
            default: ParamDefault::Required,
            rest: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.default = ParamDefault::Optional;
        self
    }

    pub fn with_default(mut self, value: ArgValue) -> Self {
        self.default = ParamDefault::Value(value);
        self
    }

    /// Capture all remaining raw text (last parameter only).
    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_required(&self) -> bool {
        self.default == ParamDefault::Required
    }

    pub fn is_rest(&self) -> bool {
        self.rest
    }

    pub fn default_value(&self) -> Option<&ArgValue> {
        match &self.default {
            ParamDefault::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match &self.converter {
            ConverterRef::Resolved(c) => c.type_name(),
            ConverterRef::Named(n) => n,
        }
    }

    /// Resolved converter; `None` until a named converter has been bound.
    pub fn converter(&self) -> Option<&Arc<dyn Converter>> {
        match &self.converter {
            ConverterRef::Resolved(c) => Some(c),
            ConverterRef::Named(_) => None,
        }
    }

    /// `<name>`, `[name]` or `[name...]`.
    pub fn usage(&self) -> String {
        let dots = if self.rest { "..." } else { "" };
        if self.is_required() {
            format!("<{}{dots}>", self.name)
        } else {
            format!("[{}{dots}]", self.name)
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("type", &self.type_name())
            .field("default", &self.default)
            .field("rest", &self.rest)
            .finish()
    }
}

// ============== Command ==============

/// A registered command.
///
/// The owning extension is held weakly: once the extension unloads the command
/// is no longer live, even if an invocation still holds the `Arc<Command>`.
pub struct Command {
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) description: String,
    pub(crate) params: Vec<Param>,
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) cooldown: CooldownSetting,
    pub(crate) hidden: bool,
    pub(crate) handler: Arc<dyn CommandHandler>,
    pub(crate) owner: Weak<ExtensionHandle>,
}

impl Command {
    pub fn builder(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> CommandBuilder {
        CommandBuilder {
            name: name.into(),
            aliases: Vec::new(),
            description: String::new(),
            params: Vec::new(),
            checks: Vec::new(),
            cooldown: CooldownSetting::Default,
            hidden: false,
            handler,
        }
    }

    /// Canonical qualified name (`"reminders list"`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn checks(&self) -> &[Arc<dyn Check>] {
        &self.checks
    }

    pub fn cooldown(&self) -> CooldownSetting {
        self.cooldown
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Name of the owning extension while it is alive.
    pub fn extension(&self) -> Option<String> {
        self.owner.upgrade().map(|h| h.name().to_string())
    }

    /// Whether the owning extension is still loaded.
    pub fn is_live(&self) -> bool {
        self.owner.upgrade().is_some_and(|h| h.is_live())
    }

    /// `name <a> [b]`
    pub fn usage(&self) -> String {
        let mut out = self.name.clone();
        for p in &self.params {
            out.push(' ');
            out.push_str(&p.usage());
        }
        out
    }

    pub(crate) fn bind_owner(&mut self, owner: &Arc<ExtensionHandle>) {
        self.owner = Arc::downgrade(owner);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("params", &self.params)
            .field("checks", &self.checks.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

pub struct CommandBuilder {
    name: String,
    aliases: Vec<String>,
    description: String,
    params: Vec<Param>,
    checks: Vec<Arc<dyn Check>>,
    cooldown: CooldownSetting,
    hidden: bool,
    handler: Arc<dyn CommandHandler>,
}

impl CommandBuilder {
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Checks run in the order they are added.
    pub fn check(mut self, check: impl Check + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    pub fn cooldown(mut self, cooldown: CooldownSetting) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Leave the command out of help listings.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn build(self) -> Result<Command> {
        let name = normalize_name(&self.name);
        let invalid = |reason: &str| ExtensionError::InvalidCommand {
            command: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("command name is empty").into());
        }

        let mut aliases = Vec::with_capacity(self.aliases.len());
        for alias in &self.aliases {
            let alias = normalize_name(alias);
            if alias.is_empty() {
                return Err(invalid("alias is empty").into());
            }
            if alias == name || aliases.contains(&alias) {
                return Err(invalid(&format!("duplicate alias {alias:?}")).into());
            }
            aliases.push(alias);
        }

        let mut seen: Vec<&str> = Vec::new();
        for (idx, param) in self.params.iter().enumerate() {
            if param.name.trim().is_empty() || param.name.contains(char::is_whitespace) {
                return Err(invalid("parameter names must be single non-empty words").into());
            }
            if seen.contains(&param.name.as_str()) {
                return Err(invalid(&format!("duplicate parameter {:?}", param.name)).into());
            }
            if param.rest && idx + 1 != self.params.len() {
                return Err(invalid(&format!(
                    "rest parameter {:?} must be the last parameter",
                    param.name
                ))
                .into());
            }
            seen.push(&param.name);
        }

        Ok(Command {
            name,
            aliases,
            description: self.description,
            params: self.params,
            checks: self.checks,
            cooldown: self.cooldown,
            hidden: self.hidden,
            handler: self.handler,
            owner: Weak::new(),
        })
    }
}

/// Collapse internal whitespace: `" reminders   list "` -> `"reminders list"`.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============== Arguments ==============

/// Parsed, typed arguments keyed by parameter name.
///
/// Only ever handed to a handler after the whole schema bound successfully.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args {
    values: HashMap<String, ArgValue>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ArgValue::as_text)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ArgValue::as_integer)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ArgValue::as_number)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ArgValue::as_bool)
    }

    pub fn duration(&self, name: &str) -> Option<std::time::Duration> {
        self.get(name).and_then(ArgValue::as_duration)
    }

    pub fn snowflake(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(ArgValue::as_snowflake)
    }

    pub fn user(&self, name: &str) -> Option<UserId> {
        match self.get(name) {
            Some(ArgValue::User(u)) => Some(*u),
            _ => None,
        }
    }

    pub fn channel(&self, name: &str) -> Option<ChannelId> {
        match self.get(name) {
            Some(ArgValue::Channel(c)) => Some(*c),
            _ => None,
        }
    }

    pub fn role(&self, name: &str) -> Option<RoleId> {
        match self.get(name) {
            Some(ArgValue::Role(r)) => Some(*r),
            _ => None,
        }
    }
}

// ============== Invocation context ==============

type CancelHook = Box<dyn FnOnce() + Send + Sync>;

/// Ephemeral per-invocation state; dropped once the outcome is reported.
pub struct InvocationContext {
    pub command: Arc<Command>,
    /// Name or alias the user typed.
    pub invoked_with: String,
    /// Text prefix used, `None` for structured interactions.
    pub prefix: Option<String>,
    pub actor: Actor,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub nsfw_channel: bool,
    pub permissions: Option<Permissions>,
    pub args: Args,
    pub target: ReplyTarget,
    pub services: Arc<Services>,
    result: Option<Reply>,
    replied: bool,
    cancel: CancellationToken,
    cancel_hooks: Vec<CancelHook>,
}

/// Where an invocation came from, minus the resolved command.
#[derive(Clone, Debug)]
pub struct InvocationSource {
    pub invoked_with: String,
    pub prefix: Option<String>,
    pub actor: Actor,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub nsfw_channel: bool,
    pub permissions: Option<Permissions>,
    pub target: ReplyTarget,
}

impl InvocationContext {
    pub fn new(
        command: Arc<Command>,
        args: Args,
        source: InvocationSource,
        services: Arc<Services>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            command,
            invoked_with: source.invoked_with,
            prefix: source.prefix,
            actor: source.actor,
            channel_id: source.channel_id,
            guild_id: source.guild_id,
            nsfw_channel: source.nsfw_channel,
            permissions: source.permissions,
            args,
            target: source.target,
            services,
            result: None,
            replied: false,
            cancel,
            cancel_hooks: Vec::new(),
        }
    }

    pub fn in_guild(&self) -> bool {
        self.guild_id.is_some()
    }

    pub fn is_owner(&self) -> bool {
        self.services.config.is_owner(self.actor.id)
    }

    /// Send a response now.
    pub async fn reply(&mut self, reply: impl Into<Reply>) -> Result<()> {
        let reply = reply.into();
        self.services.responder.send(&self.target, &reply).await?;
        self.replied = true;
        Ok(())
    }

    /// Fill the result slot; emitted once the handler succeeds.
    pub fn respond(&mut self, reply: impl Into<Reply>) {
        self.result = Some(reply.into());
    }

    pub fn has_replied(&self) -> bool {
        self.replied
    }

    pub(crate) fn take_result(&mut self) -> Option<Reply> {
        self.result.take()
    }

    /// Fires when the invocation is cancelled (shutdown).
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register cleanup that runs if the invocation is cancelled before finishing.
    pub fn on_cancel(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.cancel_hooks.push(Box::new(hook));
    }

    pub(crate) fn run_cancel_hooks(&mut self) {
        // Reverse registration order, like scoped cleanup.
        while let Some(hook) = self.cancel_hooks.pop() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{Integer, Text};

    fn noop() -> Arc<dyn CommandHandler> {
        handler_fn(|_ctx| Box::pin(async { Ok::<(), crate::Error>(()) }))
    }

    fn assert_shareable<T: Send + Sync>() {}

    #[test]
    fn invocation_context_can_be_borrowed_across_checks() {
        // Check futures hold `&InvocationContext` across awaits.
        assert_shareable::<InvocationContext>();
        assert_shareable::<CancelHook>();
    }

    #[test]
    fn builder_normalizes_names_and_usage() {
        let cmd = Command::builder("  reminders   cancel ", noop())
            .alias("reminders delete")
            .param(Param::new("id", Integer))
            .param(Param::new("reason", Text).optional().rest())
            .build()
            .unwrap();

        assert_eq!(cmd.name(), "reminders cancel");
        assert_eq!(cmd.aliases(), ["reminders delete".to_string()]);
        assert_eq!(cmd.usage(), "reminders cancel <id> [reason...]");
        // No owner bound yet.
        assert!(!cmd.is_live());
        assert_eq!(cmd.extension(), None);
    }

    #[test]
    fn rest_parameter_must_be_last() {
        let err = Command::builder("say", noop())
            .param(Param::new("text", Text).rest())
            .param(Param::new("times", Integer))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must be the last parameter"));
    }

    #[test]
    fn duplicate_params_and_aliases_are_rejected() {
        assert!(Command::builder("a", noop())
            .param(Param::new("x", Text))
            .param(Param::new("x", Integer))
            .build()
            .is_err());
        assert!(Command::builder("a", noop()).alias("a").build().is_err());
        assert!(Command::builder("   ", noop()).build().is_err());
    }

    #[test]
    fn args_typed_getters() {
        let mut args = Args::new();
        args.insert("count", ArgValue::Integer(3));
        args.insert("who", ArgValue::User(UserId(7)));

        assert_eq!(args.integer("count"), Some(3));
        assert_eq!(args.number("count"), Some(3.0));
        assert_eq!(args.user("who"), Some(UserId(7)));
        assert_eq!(args.snowflake("who"), Some(7));
        assert_eq!(args.text("count"), None);
        assert!(!args.contains("missing"));
    }
}
