//! Gateway event source: serenity callbacks -> `GatewayEvent`s on a channel.

use serenity::all::{
    CommandDataOption, CommandDataOptionValue, CommandInteraction, Context, EventHandler,
    Guild, GuildMemberUpdateEvent, Interaction, Member, Message, Reaction, Ready, User,
};
use serenity::async_trait;
use tokio::sync::mpsc;

use rook_core::{
    domain::{Actor, ChannelId, GuildId, InteractionId, MessageId, Permissions, RoleId, UserId},
    events::{
        GatewayEvent, IncomingInteraction, IncomingMessage, InteractionOption, MemberEvent,
        OptionValue, ReactionEvent, ReadyInfo,
    },
    registry::ExtensionRegistry,
};

use crate::commands;

pub struct DiscordGateway {
    events: mpsc::Sender<GatewayEvent>,
    registry: Option<ExtensionRegistry>,
}

impl DiscordGateway {
    pub fn new(events: mpsc::Sender<GatewayEvent>) -> Self {
        Self {
            events,
            registry: None,
        }
    }

    /// Sync slash commands from this registry on READY.
    pub fn with_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    async fn forward(&self, event: GatewayEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("dispatcher gone, dropping gateway event");
        }
    }
}

#[async_trait]
impl EventHandler for DiscordGateway {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "connected to Discord"
        );

        if let Some(registry) = &self.registry {
            ctx.http.set_application_id(ready.application.id);
            match commands::sync(&ctx.http, &registry.commands()).await {
                Ok(n) => tracing::info!(count = n, "slash commands synced"),
                Err(e) => tracing::warn!("failed to sync slash commands: {e}"),
            }
        }

        self.forward(GatewayEvent::Ready(ReadyInfo {
            user: actor(&ready.user),
            guild_count: ready.guilds.len(),
        }))
        .await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let nsfw_channel = channel_is_nsfw(&ctx, msg.guild_id, msg.channel_id);
        let author_permissions = msg
            .author_permissions(&ctx)
            .map(|p| Permissions::from_bits_truncate(p.bits()));

        self.forward(GatewayEvent::MessageCreate(IncomingMessage {
            id: MessageId(msg.id.get()),
            channel_id: ChannelId(msg.channel_id.get()),
            guild_id: msg.guild_id.map(|g| GuildId(g.get())),
            author: actor(&msg.author),
            content: msg.content,
            nsfw_channel,
            author_permissions,
        }))
        .await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(cmd) = interaction else {
            return;
        };
        let event = incoming_interaction(&ctx, &cmd);
        self.forward(GatewayEvent::InteractionCreate(event)).await;
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        self.forward(GatewayEvent::ReactionAdd(ReactionEvent {
            user_id: reaction.user_id.map(|u| UserId(u.get())),
            channel_id: ChannelId(reaction.channel_id.get()),
            message_id: MessageId(reaction.message_id.get()),
            guild_id: reaction.guild_id.map(|g| GuildId(g.get())),
            emoji: reaction.emoji.to_string(),
        }))
        .await;
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        self.forward(GatewayEvent::MemberJoin(MemberEvent {
            guild_id: GuildId(member.guild_id.get()),
            user: actor(&member.user),
        }))
        .await;
    }

    async fn guild_member_update(
        &self,
        _ctx: Context,
        _old: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        self.forward(GatewayEvent::MemberUpdate(MemberEvent {
            guild_id: GuildId(event.guild_id.get()),
            user: actor(&event.user),
        }))
        .await;
    }
}

fn actor(user: &User) -> Actor {
    Actor {
        id: UserId(user.id.get()),
        name: user.name.clone(),
        bot: user.bot,
    }
}

/// DMs and uncached guilds count as safe for work.
fn channel_is_nsfw(
    ctx: &Context,
    guild: Option<serenity::all::GuildId>,
    channel: serenity::all::ChannelId,
) -> bool {
    guild
        .and_then(|g| ctx.cache.guild(g))
        .is_some_and(|g| nsfw_in(&g, channel))
}

/// Threads take the flag of their parent channel.
fn nsfw_in(guild: &Guild, channel: serenity::all::ChannelId) -> bool {
    let parent = || {
        guild
            .threads
            .iter()
            .find(|t| t.id == channel)
            .and_then(|t| t.parent_id)
            .and_then(|p| guild.channels.get(&p))
    };
    guild
        .channels
        .get(&channel)
        .or_else(parent)
        .is_some_and(|c| c.nsfw)
}

fn incoming_interaction(ctx: &Context, cmd: &CommandInteraction) -> IncomingInteraction {
    let mut name = cmd.data.name.clone();
    let options = flatten_options(&cmd.data.options, &mut name);

    IncomingInteraction {
        id: InteractionId(cmd.id.get()),
        token: cmd.token.clone(),
        channel_id: ChannelId(cmd.channel_id.get()),
        guild_id: cmd.guild_id.map(|g| GuildId(g.get())),
        user: actor(&cmd.user),
        command: name,
        options,
        nsfw_channel: channel_is_nsfw(ctx, cmd.guild_id, cmd.channel_id),
        member_permissions: cmd
            .member
            .as_ref()
            .and_then(|m| m.permissions)
            .map(|p| Permissions::from_bits_truncate(p.bits())),
    }
}

/// Subcommand groups extend the qualified name; leaf values become options.
fn flatten_options(options: &[CommandDataOption], name: &mut String) -> Vec<InteractionOption> {
    let mut out = Vec::new();
    for opt in options {
        let value = match &opt.value {
            CommandDataOptionValue::SubCommand(inner)
            | CommandDataOptionValue::SubCommandGroup(inner) => {
                name.push(' ');
                name.push_str(&opt.name);
                return flatten_options(inner, name);
            }
            CommandDataOptionValue::String(s) => OptionValue::String(s.clone()),
            CommandDataOptionValue::Integer(i) => OptionValue::Integer(*i),
            CommandDataOptionValue::Number(n) => OptionValue::Number(*n),
            CommandDataOptionValue::Boolean(b) => OptionValue::Boolean(*b),
            CommandDataOptionValue::User(u) => OptionValue::User(UserId(u.get())),
            CommandDataOptionValue::Channel(c) => OptionValue::Channel(ChannelId(c.get())),
            CommandDataOptionValue::Role(r) => OptionValue::Role(RoleId(r.get())),
            other => {
                tracing::debug!(option = %opt.name, "unsupported option type {other:?}");
                continue;
            }
        };
        out.push(InteractionOption {
            name: opt.name.clone(),
            value,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use serenity::all::{ChannelId as SerenityChannelId, GuildChannel};

    use super::*;

    fn channel(id: u64, nsfw: bool, parent: Option<u64>) -> GuildChannel {
        let mut c = GuildChannel::default();
        c.id = SerenityChannelId::new(id);
        c.nsfw = nsfw;
        c.parent_id = parent.map(SerenityChannelId::new);
        c
    }

    #[test]
    fn nsfw_comes_from_the_guild_channel_list() {
        let mut guild = Guild::default();
        for c in [channel(1, true, None), channel(2, false, None)] {
            guild.channels.insert(c.id, c);
        }
        guild.threads.push(channel(10, false, Some(1)));
        guild.threads.push(channel(20, false, Some(2)));

        assert!(nsfw_in(&guild, SerenityChannelId::new(1)));
        assert!(!nsfw_in(&guild, SerenityChannelId::new(2)));
        assert!(nsfw_in(&guild, SerenityChannelId::new(10)));
        assert!(!nsfw_in(&guild, SerenityChannelId::new(20)));
        assert!(!nsfw_in(&guild, SerenityChannelId::new(99)));
    }
}
