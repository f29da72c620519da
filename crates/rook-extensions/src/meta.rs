//! Bot introspection and extension management.

use std::sync::Arc;

use async_trait::async_trait;

use rook_core::{
    checks::OwnerOnly,
    command::{handler_fn, Command, CommandHandler, InvocationContext, Param},
    convert::Text,
    cooldown::CooldownSetting,
    messaging::types::Embed,
    paginator::{ListPages, PageCursor},
    registry::{Extension, ExtensionBuilder},
    Error, Result,
};

const HELP_PER_PAGE: usize = 10;
const HELP_COLOUR: u32 = 0x5865F2;

pub struct Meta;

#[async_trait]
impl Extension for Meta {
    async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
        ext.command(
            Command::builder(
                "ping",
                handler_fn(|ctx| {
                    Box::pin(async move {
                        ctx.respond("Pong!");
                        Ok::<(), Error>(())
                    })
                }),
            )
            .description("Check that the bot is responsive.")
            .build()?,
        );

        ext.command(
            Command::builder("help", Arc::new(Help))
                .description("List the available commands.")
                .param(Param::new("page", Text).optional().describe("Page number"))
                .build()?,
        );

        for action in [Action::Load, Action::Unload, Action::Reload] {
            ext.command(
                Command::builder(format!("extension {}", action.verb()), Arc::new(action))
                    .description(action.description())
                    .param(Param::named("name", "text").describe("Extension name"))
                    .check(OwnerOnly)
                    .cooldown(CooldownSetting::Disabled)
                    .hidden()
                    .build()?,
            );
        }

        ext.command(
            Command::builder("extensions", Arc::new(ListExtensions))
                .description("Show every known extension and its state.")
                .check(OwnerOnly)
                .cooldown(CooldownSetting::Disabled)
                .hidden()
                .build()?,
        );

        Ok(())
    }
}

struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let prefix = ctx.prefix.clone().unwrap_or_else(|| "/".to_string());
        let mut commands = ctx.services.registry.commands();
        commands.retain(|c| !c.is_hidden());
        commands.sort_by(|a, b| a.name().cmp(b.name()));

        let lines: Vec<String> = commands
            .iter()
            .map(|c| {
                if c.description().is_empty() {
                    format!("`{prefix}{}`", c.usage())
                } else {
                    format!("`{prefix}{}` {}", c.usage(), c.description())
                }
            })
            .collect();
        let pages = ListPages::new(lines, HELP_PER_PAGE);
        if pages.is_empty() {
            ctx.respond("No commands are loaded.");
            return Ok(());
        }

        let mut cursor = PageCursor::new(Some(pages.max_pages()));
        let page = cursor
            .goto_number(ctx.args.text("page").unwrap_or("1"))
            .map_err(Error::user)?;

        let mut embed = Embed::new()
            .title("Commands")
            .description(pages.render(page).unwrap_or_default())
            .colour(HELP_COLOUR);
        if let Some(footer) = pages.footer(page) {
            embed = embed.footer(footer);
        }
        ctx.respond(embed);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Load,
    Unload,
    Reload,
}

impl Action {
    fn verb(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Unload => "unload",
            Self::Reload => "reload",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Load => "Load an extension.",
            Self::Unload => "Unload an extension.",
            Self::Reload => "Reload an extension, keeping the old one if the new setup fails.",
        }
    }

    fn past(self) -> &'static str {
        match self {
            Self::Load => "Loaded",
            Self::Unload => "Unloaded",
            Self::Reload => "Reloaded",
        }
    }
}

#[async_trait]
impl CommandHandler for Action {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let name = ctx.args.text("name").unwrap_or_default().trim().to_string();
        let services = ctx.services.clone();
        match self {
            Self::Load => services.load_extension(&name).await?,
            Self::Unload => services.unload_extension(&name).await?,
            Self::Reload => services.reload_extension(&name).await?,
        }
        tracing::info!(extension = %name, action = self.verb(), by = %ctx.actor.id, "extension command applied");
        ctx.respond(format!("{} `{name}`.", self.past()));
        Ok(())
    }
}

struct ListExtensions;

#[async_trait]
impl CommandHandler for ListExtensions {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let known = ctx.services.registry.extensions().await;
        if known.is_empty() {
            ctx.respond("No extensions are registered.");
            return Ok(());
        }
        let body = known
            .iter()
            .map(|(name, state)| format!("`{name}`: {state}"))
            .collect::<Vec<_>>()
            .join("\n");
        ctx.respond(Embed::new().title("Extensions").description(body));
        Ok(())
    }
}
