use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use rook_core::{
    bot::{Bot, Services},
    command::{handler_fn, Command, Param},
    config::Config,
    convert::Integer,
    cooldown::CooldownSetting,
    dispatch::{CommandOutcome, Completion, Stage},
    domain::{Actor, ChannelId, InteractionId, MessageId, UserId},
    errors::ErrorKind,
    events::{GatewayEvent, IncomingInteraction, IncomingMessage, InteractionOption, OptionValue},
    funnel::{Category, Route},
    messaging::{recording::RecordingResponder, types::ReplyTarget},
    registry::{Extension, ExtensionBuilder, ExtensionCatalog},
    store::MemoryStore,
    Error, Result,
};

const OPERATOR: ChannelId = ChannelId(999);

struct Maths;

#[async_trait]
impl Extension for Maths {
    async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
        ext.error_route(
            ErrorKind::new("maths.overflow"),
            Route::new(Category::UserInput).with_format(|err, _| format!("Too big: {err}")),
        );
        ext.command(
            Command::builder(
                "add",
                handler_fn(|ctx| {
                    Box::pin(async move {
                        let a = ctx.args.integer("a").unwrap_or_default();
                        let b = ctx.args.integer("b").unwrap_or_default();
                        let sum = a.checked_add(b).ok_or_else(|| {
                            Error::domain(ErrorKind::new("maths.overflow"), "sum does not fit")
                        })?;
                        ctx.respond(sum.to_string());
                        Ok::<(), Error>(())
                    })
                }),
            )
            .param(Param::new("a", Integer))
            .param(Param::named("b", "int"))
            .cooldown(CooldownSetting::Disabled)
            .build()?,
        );
        ext.command(
            Command::builder(
                "explode",
                handler_fn(|_ctx| {
                    Box::pin(async { Err::<(), Error>(Error::Store("disk on fire".into())) })
                }),
            )
            .cooldown(CooldownSetting::Disabled)
            .build()?,
        );
        ext.command(
            Command::builder("quiet", handler_fn(|_ctx| Box::pin(async { Ok::<(), Error>(()) })))
                .cooldown(CooldownSetting::Disabled)
                .build()?,
        );
        Ok(())
    }
}

/// A command that parks until released, tagged with the version that registered it.
struct Parked {
    version: Arc<AtomicUsize>,
    release: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl Extension for Parked {
    async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let release = self.release.clone();
        let cancelled = self.cancelled.clone();
        ext.command(
            Command::builder(
                "wait",
                handler_fn(move |ctx| {
                    let release = release.clone();
                    let cancelled = cancelled.clone();
                    Box::pin(async move {
                        ctx.on_cancel(move || cancelled.store(true, Ordering::SeqCst));
                        release.notified().await;
                        ctx.respond(format!("v{version}"));
                        Ok::<(), Error>(())
                    })
                }),
            )
            .cooldown(CooldownSetting::Disabled)
            .build()?,
        );
        Ok(())
    }
}

struct Harness {
    bot: Bot,
    services: Arc<Services>,
    responder: Arc<RecordingResponder>,
    release: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

async fn harness() -> Harness {
    let release = Arc::new(Notify::new());
    let cancelled = Arc::new(AtomicBool::new(false));
    let version = Arc::new(AtomicUsize::new(0));

    let (r, c) = (release.clone(), cancelled.clone());
    let catalog = ExtensionCatalog::new()
        .with("maths", || Arc::new(Maths) as Arc<dyn Extension>)
        .with("parked", move || {
            Arc::new(Parked {
                version: version.clone(),
                release: r.clone(),
                cancelled: c.clone(),
            }) as Arc<dyn Extension>
        });

    let mut config = Config::new("token");
    config.operator_channel = Some(OPERATOR);
    config.autoload_extensions = vec!["maths".into(), "parked".into()];

    let responder = Arc::new(RecordingResponder::new());
    let services = Services::new(
        config,
        responder.clone(),
        Arc::new(MemoryStore::new()),
        catalog,
    );
    let bot = Bot::new(services.clone());
    let report = bot.start().await.unwrap();
    assert_eq!(report.loaded, vec!["maths", "parked"]);

    Harness {
        bot,
        services,
        responder,
        release,
        cancelled,
    }
}

fn say(content: &str) -> GatewayEvent {
    GatewayEvent::MessageCreate(IncomingMessage {
        id: MessageId(1),
        channel_id: ChannelId(7),
        guild_id: None,
        author: Actor {
            id: UserId(42),
            name: "alice".into(),
            bot: false,
        },
        content: content.into(),
        nsfw_channel: false,
        author_permissions: None,
    })
}

async fn run(h: &Harness, content: &str) -> Option<Completion> {
    let outcome = h.bot.dispatcher().dispatch(say(content)).await;
    match outcome.invocation() {
        Some(inv) => Some(inv.finished().await),
        None => None,
    }
}

#[tokio::test]
async fn text_command_runs_end_to_end() {
    let h = harness().await;

    assert_eq!(run(&h, "?add 2 40").await, Some(Completion::Succeeded));
    // Extra trailing tokens are ignored.
    assert_eq!(run(&h, "?add 1 1 1").await, Some(Completion::Succeeded));
    assert_eq!(h.responder.texts(), vec!["42", "2"]);
    let (target, _) = &h.responder.sent()[0];
    assert_eq!(*target, ReplyTarget::Channel(ChannelId(7)));
}

#[tokio::test]
async fn parse_errors_report_usage_and_never_invoke() {
    let h = harness().await;

    let outcome = h.bot.dispatcher().dispatch(say("?add 1 abc")).await;
    assert_eq!(outcome.rejected_at(), Some(Stage::Parse));
    let text = h.responder.texts().pop().unwrap();
    assert!(text.contains("could not parse argument b"), "{text}");
    assert!(text.contains("Usage: `?add <a> <b>`"), "{text}");

    h.responder.clear();
    let outcome = h.bot.dispatcher().dispatch(say("?add 1")).await;
    assert!(matches!(
        outcome.command,
        Some(CommandOutcome::Rejected {
            stage: Stage::Parse,
            category: Category::UserInput
        })
    ));
    assert!(h.responder.texts()[0].starts_with("b is a required argument that is missing"));
}

#[tokio::test]
async fn errors_are_routed_by_kind() {
    let h = harness().await;

    // Extension-registered route.
    let done = run(&h, &format!("?add {} 1", i64::MAX)).await;
    assert_eq!(done, Some(Completion::Failed(Category::UserInput)));
    assert_eq!(h.responder.texts(), vec!["Too big: sum does not fit"]);

    // Internal: operator report plus generic user notice.
    h.responder.clear();
    let done = run(&h, "?explode").await;
    assert_eq!(done, Some(Completion::Failed(Category::Internal)));
    let sent = h.responder.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, ReplyTarget::Channel(OPERATOR));
    assert!(sent[0].1.plain_text().contains("disk on fire"));
    assert_eq!(
        sent[1].1.plain_text(),
        "Something went wrong while running this command."
    );
    assert!(!sent[1].1.plain_text().contains("disk"));
}

#[tokio::test]
async fn interactions_share_the_command_table() {
    let h = harness().await;

    let interaction = |command: &str, options: Vec<InteractionOption>| {
        GatewayEvent::InteractionCreate(IncomingInteraction {
            id: InteractionId(5),
            token: "tok".into(),
            channel_id: ChannelId(7),
            guild_id: None,
            user: Actor {
                id: UserId(42),
                name: "alice".into(),
                bot: false,
            },
            command: command.into(),
            options,
            nsfw_channel: false,
            member_permissions: None,
        })
    };

    let outcome = h
        .bot
        .dispatcher()
        .dispatch(interaction(
            "add",
            vec![
                InteractionOption {
                    name: "a".into(),
                    value: OptionValue::Integer(3),
                },
                InteractionOption {
                    name: "b".into(),
                    value: OptionValue::Integer(4),
                },
            ],
        ))
        .await;
    assert_eq!(
        outcome.invocation().unwrap().finished().await,
        Completion::Succeeded
    );

    // No explicit reply: the interaction still gets acknowledged.
    let outcome = h.bot.dispatcher().dispatch(interaction("quiet", vec![])).await;
    outcome.invocation().unwrap().finished().await;

    let sent = h.responder.sent();
    assert_eq!(sent[0].1.plain_text(), "7");
    assert_eq!(sent[1].1.plain_text(), "Done.");
    assert!(sent[1].1.ephemeral);
    assert!(matches!(sent[1].0, ReplyTarget::Interaction { .. }));
}

#[tokio::test]
async fn reload_keeps_in_flight_invocations_on_their_version() {
    let h = harness().await;

    let first = h
        .bot
        .dispatcher()
        .dispatch(say("?wait"))
        .await
        .invocation()
        .unwrap();
    h.services.reload_extension("parked").await.unwrap();
    // The old handler object is still the one running.
    h.release.notify_one();
    assert_eq!(first.finished().await, Completion::Succeeded);

    let second = h
        .bot
        .dispatcher()
        .dispatch(say("?wait"))
        .await
        .invocation()
        .unwrap();
    h.release.notify_one();
    assert_eq!(second.finished().await, Completion::Succeeded);

    assert_eq!(h.responder.texts(), vec!["v1", "v2"]);
}

#[tokio::test]
async fn unloaded_commands_stop_resolving() {
    let h = harness().await;
    let cmd = h.services.registry.resolve("add").unwrap();

    h.services.unload_extension("maths").await.unwrap();
    assert!(!cmd.is_live());
    let outcome = h.bot.dispatcher().dispatch(say("?add 1 2")).await;
    assert!(matches!(outcome.command, Some(CommandOutcome::Unknown { .. })));
    assert!(h.responder.sent().is_empty());

    h.services.load_extension("maths").await.unwrap();
    assert_eq!(run(&h, "?add 1 2").await, Some(Completion::Succeeded));
}

#[tokio::test]
async fn shutdown_cancels_stragglers_and_runs_cleanup() {
    let h = harness().await;

    let parked = h
        .bot
        .dispatcher()
        .dispatch(say("?wait"))
        .await
        .invocation()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = h
        .bot
        .shutdown_with_grace(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(!report.drained);
    assert_eq!(parked.finished().await, Completion::Cancelled);
    assert!(h.cancelled.load(Ordering::SeqCst));
    assert!(h.services.registry.commands().is_empty());

    let after = h.bot.dispatcher().dispatch(say("?add 1 2")).await;
    assert!(after.command.is_none());
}
