//! Error funnel: every terminal error from dispatch and the scheduler ends here.
//!
//! Routing is a table keyed by [`ErrorKind`]. Each route names a category
//! (which decides the destination) and optionally a formatter. Extensions add
//! rows for their own kinds while loaded.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, RwLock},
};

use crate::{
    domain::{Actor, ChannelId, GuildId},
    errors::{kinds, Error, ErrorKind},
    events::EventKind,
    messaging::{
        port::Responder,
        types::{Embed, Reply, ReplyTarget},
    },
};

const GENERIC_FAILURE: &str = "Something went wrong while running this command.";
const OPERATOR_REPORT_LIMIT: usize = 3_900;
const ERROR_COLOUR: u32 = 0xE74C3C;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Corrective message back to the invoking surface.
    UserInput,
    /// Terse refusal, no detail.
    Check,
    /// Refusal with retry-after.
    RateLimited,
    /// Logged with full context and sent to the operator; the user sees a generic notice.
    Internal,
    /// Dropped (debug log only).
    Silent,
}

pub type Formatter = Arc<dyn Fn(&Error, &Origin) -> String + Send + Sync>;

#[derive(Clone)]
pub struct Route {
    pub category: Category,
    format: Option<Formatter>,
}

impl Route {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            format: None,
        }
    }

    pub fn with_format(
        mut self,
        format: impl Fn(&Error, &Origin) -> String + Send + Sync + 'static,
    ) -> Self {
        self.format = Some(Arc::new(format));
        self
    }

    /// User-facing text for this error.
    pub fn render(&self, err: &Error, origin: &Origin) -> String {
        if let Some(f) = &self.format {
            return f(err, origin);
        }
        match self.category {
            Category::UserInput => match (err, origin) {
                (
                    Error::Parse(_),
                    Origin::Command {
                        usage: Some(usage), ..
                    },
                ) => format!("{err}\nUsage: `{usage}`"),
                _ => err.to_string(),
            },
            Category::Check => err.to_string(),
            Category::RateLimited => match err {
                Error::RateLimit(rl) => format!(
                    "You are on cooldown. Try again in {:.2}s.",
                    rl.retry_after().as_secs_f64()
                ),
                _ => "You are on cooldown.".to_string(),
            },
            Category::Internal => GENERIC_FAILURE.to_string(),
            Category::Silent => String::new(),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("category", &self.category)
            .field("custom_format", &self.format.is_some())
            .finish()
    }
}

/// Where a failure happened.
#[derive(Clone, Debug)]
pub enum Origin {
    Command {
        command: String,
        /// Rendered usage, shown with parse errors.
        usage: Option<String>,
        actor: Actor,
        channel_id: ChannelId,
        guild_id: Option<GuildId>,
    },
    Listener {
        extension: String,
        event: EventKind,
    },
    Task {
        task_id: String,
        kind: String,
    },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command {
                command,
                actor,
                channel_id,
                guild_id,
                ..
            } => {
                write!(
                    f,
                    "command {command:?} by {} ({}) in channel {channel_id}",
                    actor.name, actor.id
                )?;
                if let Some(g) = guild_id {
                    write!(f, " of guild {g}")?;
                }
                Ok(())
            }
            Self::Listener { extension, event } => {
                write!(f, "listener of {extension:?} on {event:?}")
            }
            Self::Task { task_id, kind } => write!(f, "task {task_id} ({kind})"),
        }
    }
}

#[derive(Clone)]
pub struct ErrorFunnel {
    inner: Arc<FunnelInner>,
}

struct FunnelInner {
    responder: Arc<dyn Responder>,
    operator_channel: Option<ChannelId>,
    routes: RwLock<HashMap<ErrorKind, Route>>,
    builtin: HashSet<ErrorKind>,
}

impl ErrorFunnel {
    pub fn new(responder: Arc<dyn Responder>, operator_channel: Option<ChannelId>) -> Self {
        let routes = builtin_routes();
        let builtin = routes.keys().cloned().collect();
        Self {
            inner: Arc::new(FunnelInner {
                responder,
                operator_channel,
                routes: RwLock::new(routes),
                builtin,
            }),
        }
    }

    pub fn is_builtin(&self, kind: &ErrorKind) -> bool {
        self.inner.builtin.contains(kind)
    }

    pub fn register(&self, kind: ErrorKind, route: Route) {
        if let Ok(mut routes) = self.inner.routes.write() {
            routes.insert(kind, route);
        }
    }

    /// Built-in routes cannot be removed.
    pub fn unregister(&self, kind: &ErrorKind) -> bool {
        if self.is_builtin(kind) {
            return false;
        }
        self.inner
            .routes
            .write()
            .map(|mut routes| routes.remove(kind).is_some())
            .unwrap_or(false)
    }

    /// Unknown kinds are internal.
    pub fn classify(&self, err: &Error) -> Route {
        let kind = err.kind();
        self.inner
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&kind).cloned())
            .unwrap_or_else(|| Route::new(Category::Internal))
    }

    /// Classify, log and emit. `target` is the invoking surface, if any.
    pub async fn report(&self, origin: &Origin, target: Option<&ReplyTarget>, err: &Error) -> Category {
        let route = self.classify(err);
        let kind = err.kind();

        match route.category {
            Category::Silent => {
                tracing::debug!(%origin, %kind, "dropping error: {err}");
            }
            Category::Internal => {
                let chain = error_chain(err);
                tracing::error!(%origin, %kind, error = %chain, "unhandled error");
                self.notify_operator(origin, &kind, &chain).await;
            }
            Category::UserInput | Category::Check | Category::RateLimited => {
                tracing::debug!(%origin, %kind, "reporting to user: {err}");
            }
        }

        if route.category != Category::Silent {
            if let Some(target) = target {
                let text = route.render(err, origin);
                if !text.is_empty() {
                    let reply = Reply::text(text).ephemeral();
                    if let Err(e) = self.inner.responder.send(target, &reply).await {
                        tracing::warn!(%origin, "failed to deliver error reply: {e}");
                    }
                }
            }
        }

        route.category
    }

    async fn notify_operator(&self, origin: &Origin, kind: &ErrorKind, chain: &str) {
        let Some(channel) = self.inner.operator_channel else {
            return;
        };

        let mut body = chain.to_string();
        if body.len() > OPERATOR_REPORT_LIMIT {
            let mut cut = OPERATOR_REPORT_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push('…');
        }

        let embed = Embed::new()
            .title("Unhandled error")
            .description(format!("```\n{body}\n```"))
            .field("Origin", origin.to_string(), false)
            .field("Kind", kind.to_string(), true)
            .colour(ERROR_COLOUR);

        if let Err(e) = self
            .inner
            .responder
            .send(&ReplyTarget::Channel(channel), &Reply::embed(embed))
            .await
        {
            tracing::warn!("failed to notify operator channel {channel}: {e}");
        }
    }
}

/// `outer: inner: root`
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        let text = s.to_string();
        // thiserror `transparent`/`{source}` messages often repeat the cause.
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = s.source();
    }
    out
}

fn builtin_routes() -> HashMap<ErrorKind, Route> {
    use Category::*;

    let table = [
        (kinds::COMMAND_NOT_FOUND, Silent),
        (kinds::MISSING_ARGUMENT, UserInput),
        (kinds::BAD_ARGUMENT, UserInput),
        (kinds::USER_INPUT, UserInput),
        (kinds::CHECK_FAILURE, Check),
        (kinds::ON_COOLDOWN, RateLimited),
        (kinds::CANCELLED, Silent),
        (kinds::EXTENSION_ALREADY_LOADED, UserInput),
        (kinds::EXTENSION_NOT_FOUND, UserInput),
        (kinds::EXTENSION_NOT_LOADED, UserInput),
        (kinds::EXTENSION_SETUP, UserInput),
        (kinds::EXTENSION_CONFLICT, UserInput),
        (kinds::EXTENSION_INVALID_COMMAND, UserInput),
        (kinds::TASK_NOT_FOUND, UserInput),
        (kinds::TASK_INVALID_STATE, UserInput),
        (kinds::HANDLER, Internal),
        (kinds::TASK_FAILED, Internal),
        (kinds::SCHEDULER_STOPPED, Internal),
        (kinds::STORE, Internal),
        (kinds::IO, Internal),
        (kinds::JSON, Internal),
        (kinds::EXTERNAL, Internal),
        (kinds::CONFIG, Internal),
    ];

    table
        .into_iter()
        .map(|(kind, category)| (kind, Route::new(category)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        domain::UserId,
        errors::{CheckFailure, ParseError, RateLimitError},
        messaging::recording::RecordingResponder,
    };

    fn origin() -> Origin {
        Origin::Command {
            command: "roll".to_string(),
            usage: Some("roll [dice] [sides]".to_string()),
            actor: Actor {
                id: UserId(1),
                name: "ann".to_string(),
                bot: false,
            },
            channel_id: ChannelId(10),
            guild_id: None,
        }
    }

    fn funnel(operator: Option<ChannelId>) -> (ErrorFunnel, Arc<RecordingResponder>) {
        let rec = Arc::new(RecordingResponder::new());
        (ErrorFunnel::new(rec.clone(), operator), rec)
    }

    #[tokio::test]
    async fn expected_errors_go_back_to_user_only() {
        let (f, rec) = funnel(Some(ChannelId(99)));
        let target = ReplyTarget::Channel(ChannelId(10));

        let err: Error = ParseError::MissingRequiredArgument("dice".to_string()).into();
        assert_eq!(f.report(&origin(), Some(&target), &err).await, Category::UserInput);

        let err: Error = CheckFailure {
            check: "guild_only".to_string(),
            reason: "Not here.".to_string(),
        }
        .into();
        assert_eq!(f.report(&origin(), Some(&target), &err).await, Category::Check);

        let err: Error = RateLimitError::CommandOnCooldown {
            command: "roll".to_string(),
            retry_after: Duration::from_millis(1500),
        }
        .into();
        assert_eq!(f.report(&origin(), Some(&target), &err).await, Category::RateLimited);

        let sent = rec.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(t, _)| *t == target));
        let texts = rec.texts();
        assert!(texts[0].contains("dice is a required argument"));
        assert!(texts[0].contains("Usage: `roll [dice] [sides]`"));
        assert_eq!(texts[1], "Not here.");
        assert_eq!(texts[2], "You are on cooldown. Try again in 1.50s.");
    }

    #[tokio::test]
    async fn internal_errors_reach_operator_with_generic_user_notice() {
        let (f, rec) = funnel(Some(ChannelId(99)));
        let target = ReplyTarget::Channel(ChannelId(10));

        let err: Error = anyhow::anyhow!("database exploded").into();
        assert_eq!(f.report(&origin(), Some(&target), &err).await, Category::Internal);

        let sent = rec.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, ReplyTarget::Channel(ChannelId(99)));
        assert!(sent[0].1.plain_text().contains("database exploded"));
        assert_eq!(sent[1].0, target);
        assert_eq!(sent[1].1.plain_text(), GENERIC_FAILURE);
    }

    #[tokio::test]
    async fn extension_kinds_are_table_driven() {
        let (f, rec) = funnel(None);
        let kind = ErrorKind::new("reminders.too_far");
        let err = Error::domain(kind.clone(), "too far");

        // Unregistered kinds are internal.
        assert_eq!(f.classify(&err).category, Category::Internal);

        f.register(
            kind.clone(),
            Route::new(Category::UserInput).with_format(|e, _| format!("Sorry: {e}")),
        );
        let target = ReplyTarget::Channel(ChannelId(1));
        assert_eq!(f.report(&origin(), Some(&target), &err).await, Category::UserInput);
        assert_eq!(rec.texts(), vec!["Sorry: too far".to_string()]);

        assert!(f.unregister(&kind));
        assert!(!f.unregister(&kinds::HANDLER));
        assert_eq!(f.classify(&err).category, Category::Internal);
    }

    #[tokio::test]
    async fn silent_errors_emit_nothing() {
        let (f, rec) = funnel(Some(ChannelId(99)));
        let err: Error = ParseError::CommandNotFound("nope".to_string()).into();
        let target = ReplyTarget::Channel(ChannelId(1));
        assert_eq!(f.report(&origin(), Some(&target), &err).await, Category::Silent);
        assert!(rec.sent().is_empty());
    }
}
