//! Dispatch core: event routing and the per-invocation pipeline.
//!
//! `Received -> Resolved -> Checked -> Admitted -> Invoked -> Reported`.
//! Resolution, checks and the cooldown gate run in arrival order inside
//! [`Dispatcher::dispatch`]; the handler itself runs as an independent task so
//! a slow command never delays the ones dispatched after it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    bot::Services,
    command::{Command, InvocationContext, InvocationSource},
    cooldown::{Acquire, ScopeKey},
    errors::{ParseError, RateLimitError},
    events::{EventKind, GatewayEvent, IncomingInteraction, IncomingMessage, UnknownCommand},
    funnel::{Category, Origin},
    messaging::types::{Reply, ReplyTarget},
    parser::{self, ParseFailure, Parsed},
    registry::ListenerEntry,
    Error,
};

/// Time allowed for cancel hooks after in-flight work is cancelled.
const CANCEL_DRAIN: Duration = Duration::from_secs(5);

/// Pipeline stage at which an invocation was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Check,
    /// The command's extension was unloaded between resolution and admission.
    Unloaded,
    Cooldown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parse => "parse",
            Self::Check => "check",
            Self::Unloaded => "unloaded",
            Self::Cooldown => "cooldown",
        })
    }
}

/// How an admitted invocation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed(Category),
    Cancelled,
}

/// A running handler.
#[derive(Debug)]
pub struct Invocation {
    pub command: String,
    handle: JoinHandle<Completion>,
}

impl Invocation {
    /// Wait for the handler (and its reporting) to finish.
    pub async fn finished(self) -> Completion {
        self.handle.await.unwrap_or(Completion::Cancelled)
    }
}

#[derive(Debug)]
pub enum CommandOutcome {
    /// Command-shaped input naming no command.
    Unknown { name: String },
    Rejected { stage: Stage, category: Category },
    Started(Invocation),
}

/// Result of dispatching one event.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Listener tasks started for the event.
    pub listeners: usize,
    /// Set when the event was command-shaped.
    pub command: Option<CommandOutcome>,
}

impl Outcome {
    pub fn invocation(self) -> Option<Invocation> {
        match self.command {
            Some(CommandOutcome::Started(inv)) => Some(inv),
            _ => None,
        }
    }

    pub fn rejected_at(&self) -> Option<Stage> {
        match &self.command {
            Some(CommandOutcome::Rejected { stage, .. }) => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

struct DispatchInner {
    services: Arc<Services>,
    tracker: TaskTracker,
    /// Stop accepting new events.
    stop: CancellationToken,
    /// Cancel in-flight handlers and listeners.
    cancel: CancellationToken,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                services,
                tracker: TaskTracker::new(),
                stop: CancellationToken::new(),
                cancel: CancellationToken::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    /// Handlers and listeners currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Consume events until the channel closes or shutdown starts.
    pub async fn run(&self, mut events: mpsc::Receiver<GatewayEvent>) {
        loop {
            tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                    }
                    None => {
                        tracing::info!("event source closed");
                        break;
                    }
                },
            }
        }
    }

    pub async fn dispatch(&self, event: GatewayEvent) -> Outcome {
        if !self.inner.accepting.load(Ordering::Acquire) {
            tracing::debug!(kind = ?event.kind(), "dropping event during shutdown");
            return Outcome::default();
        }

        let event = Arc::new(event);
        let mut outcome = Outcome {
            listeners: self.fan_out(&event),
            command: None,
        };

        outcome.command = match event.as_ref() {
            GatewayEvent::MessageCreate(msg) if !msg.author.bot => self.on_message(msg).await,
            GatewayEvent::InteractionCreate(it) => Some(self.on_interaction(it).await),
            _ => None,
        };
        outcome
    }

    /// Stop accepting events, give in-flight work `grace` to finish, then
    /// cancel it. Returns `true` when everything finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.stop.cancel();
        self.inner.tracker.close();

        let running = self.inner.tracker.len();
        if running > 0 {
            tracing::info!(running, "waiting for in-flight invocations");
        }

        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            return true;
        }

        tracing::warn!(
            running = self.inner.tracker.len(),
            "grace period elapsed, cancelling in-flight invocations"
        );
        self.inner.cancel.cancel();
        if tokio::time::timeout(CANCEL_DRAIN, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::error!("in-flight invocations did not unwind after cancellation");
        }
        false
    }

    // ============== Commands ==============

    async fn on_message(&self, msg: &IncomingMessage) -> Option<CommandOutcome> {
        let services = &self.inner.services;
        let table = services.registry.table();
        let parsed = parser::parse_text(&msg.content, &services.config.command_prefixes, &*table)?;

        let source = InvocationSource {
            invoked_with: String::new(),
            // Replaced by the matched prefix once the parse succeeds.
            prefix: services.config.command_prefixes.first().cloned(),
            actor: msg.author.clone(),
            channel_id: msg.channel_id,
            guild_id: msg.guild_id,
            nsfw_channel: msg.nsfw_channel,
            permissions: msg.author_permissions,
            target: ReplyTarget::Channel(msg.channel_id),
        };
        Some(self.admit(parsed, source).await)
    }

    async fn on_interaction(&self, it: &IncomingInteraction) -> CommandOutcome {
        let table = self.inner.services.registry.table();
        let parsed = parser::parse_interaction(it, &*table);

        let source = InvocationSource {
            invoked_with: String::new(),
            prefix: None,
            actor: it.user.clone(),
            channel_id: it.channel_id,
            guild_id: it.guild_id,
            nsfw_channel: it.nsfw_channel,
            permissions: it.member_permissions,
            target: ReplyTarget::Interaction {
                id: it.id,
                token: it.token.clone(),
            },
        };
        self.admit(parsed, source).await
    }

    /// Everything between resolution and handler start.
    async fn admit(
        &self,
        parsed: Result<Parsed, ParseFailure>,
        mut source: InvocationSource,
    ) -> CommandOutcome {
        let services = &self.inner.services;

        let parsed = match parsed {
            Ok(p) => p,
            Err(ParseFailure {
                error: ParseError::CommandNotFound(name),
                ..
            }) => {
                self.unknown_command(&name, &source);
                return CommandOutcome::Unknown { name };
            }
            Err(failure) => {
                let origin = command_origin(failure.command.as_deref(), &failure.invoked_with, &source);
                let category = services
                    .funnel
                    .report(&origin, Some(&source.target), &failure.error.into())
                    .await;
                return CommandOutcome::Rejected {
                    stage: Stage::Parse,
                    category,
                };
            }
        };

        source.invoked_with = parsed.invoked_with;
        if parsed.prefix.is_some() {
            source.prefix = parsed.prefix;
        }
        let command = parsed.command;
        let origin = command_origin(Some(&*command), &source.invoked_with, &source);
        let target = source.target.clone();

        let cancel = self.inner.cancel.child_token();
        let ctx = InvocationContext::new(command.clone(), parsed.args, source, services.clone(), cancel);

        // Checks in declaration order; no cooldown token is spent on a refusal.
        for check in command.checks() {
            if let Err(failure) = check.check(&ctx).await {
                tracing::debug!(command = %command.name(), check = %failure.check, "check failed");
                let category = services
                    .funnel
                    .report(&origin, Some(&target), &Error::Check(failure))
                    .await;
                return CommandOutcome::Rejected {
                    stage: Stage::Check,
                    category,
                };
            }
        }

        if !command.is_live() {
            tracing::debug!(command = %command.name(), "command unloaded before admission");
            let err = Error::Parse(ParseError::CommandNotFound(command.name().to_string()));
            let category = services.funnel.report(&origin, Some(&target), &err).await;
            return CommandOutcome::Rejected {
                stage: Stage::Unloaded,
                category,
            };
        }

        if let Some(policy) = command.cooldown().resolve(services.config.default_cooldown) {
            let key = ScopeKey::for_scope(policy.scope, ctx.actor.id, ctx.channel_id, ctx.guild_id);
            if let Acquire::Denied { retry_after } = services
                .cooldowns
                .try_acquire(command.name(), key, &policy)
                .await
            {
                let err = Error::RateLimit(RateLimitError::CommandOnCooldown {
                    command: command.name().to_string(),
                    retry_after,
                });
                let category = services.funnel.report(&origin, Some(&target), &err).await;
                return CommandOutcome::Rejected {
                    stage: Stage::Cooldown,
                    category,
                };
            }
        }

        let name = command.name().to_string();
        let handle = self.inner.tracker.spawn(invoke(ctx, origin, services.clone()));
        CommandOutcome::Started(Invocation {
            command: name,
            handle,
        })
    }

    fn unknown_command(&self, name: &str, source: &InvocationSource) {
        let event = Arc::new(GatewayEvent::UnknownCommand(UnknownCommand {
            name: name.to_string(),
            channel_id: source.channel_id,
            guild_id: source.guild_id,
            actor: source.actor.clone(),
        }));
        if self.fan_out(&event) == 0 {
            tracing::debug!(command = %name, "ignoring unknown command");
        }
    }

    // ============== Listeners ==============

    /// Start every live listener for the event. Returns how many were started.
    fn fan_out(&self, event: &Arc<GatewayEvent>) -> usize {
        let kind = event.kind();
        let listeners = self.inner.services.registry.listeners_for(kind);
        for entry in &listeners {
            self.inner.tracker.spawn(run_listener(
                entry.clone(),
                event.clone(),
                kind,
                self.inner.services.clone(),
                self.inner.cancel.child_token(),
            ));
        }
        listeners.len()
    }
}

fn command_origin(command: Option<&Command>, invoked_with: &str, source: &InvocationSource) -> Origin {
    Origin::Command {
        command: command
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| invoked_with.to_string()),
        usage: command.map(|c| {
            let prefix = source.prefix.as_deref().unwrap_or("/");
            format!("{prefix}{}", c.usage())
        }),
        actor: source.actor.clone(),
        channel_id: source.channel_id,
        guild_id: source.guild_id,
    }
}

/// Run the handler in its own task, emit its result, report its failure.
async fn invoke(mut ctx: InvocationContext, origin: Origin, services: Arc<Services>) -> Completion {
    let command = ctx.command.name().to_string();
    let target = ctx.target.clone();
    let handler = ctx.command.handler.clone();

    let run = tokio::spawn(async move {
        let cancel = ctx.cancellation();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = handler.call(&mut ctx) => Some(r),
        };
        if result.is_none() {
            ctx.run_cancel_hooks();
        }
        (ctx, result)
    });

    match run.await {
        Ok((mut ctx, Some(Ok(())))) => {
            let reply = match ctx.take_result() {
                Some(reply) => Some(reply),
                // Interactions must be answered.
                None if !ctx.has_replied() && matches!(target, ReplyTarget::Interaction { .. }) => {
                    Some(Reply::text("Done.").ephemeral())
                }
                None => None,
            };
            if let Some(reply) = reply {
                if let Err(e) = services.responder.send(&target, &reply).await {
                    tracing::warn!(command = %command, "failed to send reply: {e}");
                }
            }
            Completion::Succeeded
        }
        Ok((_, Some(Err(e)))) => {
            Completion::Failed(services.funnel.report(&origin, Some(&target), &e).await)
        }
        Ok((_, None)) => {
            tracing::info!(command = %command, "invocation cancelled");
            Completion::Cancelled
        }
        Err(join_err) => {
            let err = Error::Handler(anyhow::anyhow!("command handler panicked: {join_err}"));
            Completion::Failed(services.funnel.report(&origin, Some(&target), &err).await)
        }
    }
}

async fn run_listener(
    entry: ListenerEntry,
    event: Arc<GatewayEvent>,
    kind: EventKind,
    services: Arc<Services>,
    cancel: CancellationToken,
) {
    let origin = Origin::Listener {
        extension: entry.extension.clone(),
        event: kind,
    };
    let listener = entry.listener.clone();
    let svc = services.clone();
    let mut run = tokio::spawn(async move { listener.on_event(&event, &svc).await });

    let result = tokio::select! {
        r = &mut run => r,
        _ = cancel.cancelled() => {
            run.abort();
            tracing::debug!(extension = %entry.extension, ?kind, "listener cancelled");
            return;
        }
    };

    let err = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(join_err) => Error::Handler(anyhow::anyhow!("listener panicked: {join_err}")),
    };
    services.funnel.report(&origin, None, &err).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        checks::check_fn,
        command::handler_fn,
        config::Config,
        cooldown::{BucketScope, CooldownPolicy, CooldownSetting},
        domain::{Actor, ChannelId, MessageId, UserId},
        messaging::recording::RecordingResponder,
        registry::{Extension, ExtensionBuilder, ExtensionCatalog, Listener},
        store::MemoryStore,
        Result,
    };

    struct Gated {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Extension for Gated {
        async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
            let calls = self.calls.clone();
            ext.command(
                Command::builder(
                    "secret",
                    handler_fn(move |ctx| {
                        let calls = calls.clone();
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            ctx.respond("ok");
                            Ok::<(), Error>(())
                        })
                    }),
                )
                .check(check_fn("is_alice", |ctx| {
                    if ctx.actor.name == "alice" {
                        Ok(())
                    } else {
                        Err("only alice may ask".to_string())
                    }
                }))
                .cooldown(CooldownSetting::Custom(CooldownPolicy::new(
                    1,
                    Duration::from_secs(60),
                    BucketScope::User,
                )))
                .build()?,
            );
            Ok(())
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Listener for Counter {
        async fn on_event(&self, _event: &GatewayEvent, _services: &Arc<Services>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Unknowns(Arc<AtomicUsize>);

    #[async_trait]
    impl Extension for Unknowns {
        async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
            ext.listener(EventKind::UnknownCommand, Arc::new(Counter(self.0.clone())));
            Ok(())
        }
    }

    fn message(author: &str, id: u64, content: &str) -> GatewayEvent {
        GatewayEvent::MessageCreate(IncomingMessage {
            id: MessageId(1),
            channel_id: ChannelId(10),
            guild_id: None,
            author: Actor {
                id: UserId(id),
                name: author.to_string(),
                bot: false,
            },
            content: content.to_string(),
            nsfw_channel: false,
            author_permissions: None,
        })
    }

    async fn setup() -> (Dispatcher, Arc<RecordingResponder>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let unknowns = Arc::new(AtomicUsize::new(0));
        let (c, u) = (calls.clone(), unknowns.clone());
        let catalog = ExtensionCatalog::new()
            .with("gated", move || Arc::new(Gated { calls: c.clone() }) as Arc<dyn Extension>)
            .with("unknowns", move || Arc::new(Unknowns(u.clone())) as Arc<dyn Extension>);

        let responder = Arc::new(RecordingResponder::new());
        let services = Services::new(
            Config::new("t"),
            responder.clone(),
            Arc::new(MemoryStore::new()),
            catalog,
        );
        services.registry.load("gated", &services).await.unwrap();
        (Dispatcher::new(services), responder, calls, unknowns)
    }

    #[tokio::test]
    async fn failing_check_spends_no_cooldown_token() {
        let (d, responder, calls, _) = setup().await;
        let services = d.services().clone();
        let key = ScopeKey::User(UserId(2));

        let out = d.dispatch(message("mallory", 2, "?secret")).await;
        assert_eq!(out.rejected_at(), Some(Stage::Check));
        assert_eq!(services.cooldowns.tokens("secret", key).await, None);
        assert_eq!(responder.sent().len(), 1);

        let alice = ScopeKey::User(UserId(1));
        let out = d.dispatch(message("alice", 1, "?secret")).await;
        let done = out.invocation().unwrap().finished().await;
        assert_eq!(done, Completion::Succeeded);
        assert_eq!(services.cooldowns.tokens("secret", alice).await, Some(0));

        let out = d.dispatch(message("alice", 1, "?secret")).await;
        assert_eq!(out.rejected_at(), Some(Stage::Cooldown));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(responder
            .texts()
            .iter()
            .any(|t| t.starts_with("You are on cooldown")));
    }

    #[tokio::test]
    async fn unknown_commands_are_silent_without_a_listener() {
        let (d, responder, _, unknowns) = setup().await;

        let out = d.dispatch(message("alice", 1, "?nope")).await;
        assert!(matches!(out.command, Some(CommandOutcome::Unknown { .. })));
        assert!(responder.sent().is_empty());

        let services = d.services().clone();
        services.registry.load("unknowns", &services).await.unwrap();
        let out = d.dispatch(message("alice", 1, "?nope")).await;
        assert!(matches!(out.command, Some(CommandOutcome::Unknown { .. })));
        d.shutdown(Duration::from_secs(1)).await;
        assert_eq!(unknowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plain_and_bot_messages_are_not_commands() {
        let (d, _, calls, _) = setup().await;

        assert!(d.dispatch(message("alice", 1, "hello")).await.command.is_none());
        assert!(d.dispatch(message("alice", 1, "? secret")).await.command.is_none());

        let mut bot = message("alice", 1, "?secret");
        if let GatewayEvent::MessageCreate(m) = &mut bot {
            m.author.bot = true;
        }
        assert!(d.dispatch(bot).await.command.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nothing_is_accepted_after_shutdown() {
        let (d, _, calls, _) = setup().await;
        assert!(d.shutdown(Duration::from_millis(10)).await);
        let out = d.dispatch(message("alice", 1, "?secret")).await;
        assert!(out.command.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
