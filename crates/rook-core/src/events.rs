//! Platform-agnostic gateway event model.
//!
//! Discord-specific fields stay in the gateway adapter; the core only sees these.

use crate::domain::{
    Actor, ChannelId, GuildId, InteractionId, MessageId, Permissions, RoleId, UserId,
};

#[derive(Clone, Debug)]
pub enum GatewayEvent {
    Ready(ReadyInfo),
    MessageCreate(IncomingMessage),
    InteractionCreate(IncomingInteraction),
    ReactionAdd(ReactionEvent),
    MemberJoin(MemberEvent),
    MemberUpdate(MemberEvent),
    /// Synthesized by the dispatcher when command-shaped input names no command.
    UnknownCommand(UnknownCommand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    MessageCreate,
    InteractionCreate,
    ReactionAdd,
    MemberJoin,
    MemberUpdate,
    UnknownCommand,
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready(_) => EventKind::Ready,
            Self::MessageCreate(_) => EventKind::MessageCreate,
            Self::InteractionCreate(_) => EventKind::InteractionCreate,
            Self::ReactionAdd(_) => EventKind::ReactionAdd,
            Self::MemberJoin(_) => EventKind::MemberJoin,
            Self::MemberUpdate(_) => EventKind::MemberUpdate,
            Self::UnknownCommand(_) => EventKind::UnknownCommand,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReadyInfo {
    pub user: Actor,
    pub guild_count: usize,
}

#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub author: Actor,
    pub content: String,
    pub nsfw_channel: bool,
    /// Resolved channel permissions of the author, when the adapter knows them.
    pub author_permissions: Option<Permissions>,
}

/// A structured (slash) command invocation.
#[derive(Clone, Debug)]
pub struct IncomingInteraction {
    pub id: InteractionId,
    pub token: String,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub user: Actor,
    /// Qualified command name (`"reminders list"` for subcommands).
    pub command: String,
    pub options: Vec<InteractionOption>,
    pub nsfw_channel: bool,
    pub member_permissions: Option<Permissions>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InteractionOption {
    pub name: String,
    pub value: OptionValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    User(UserId),
    Channel(ChannelId),
    Role(RoleId),
}

impl OptionValue {
    /// Textual form, as a user would have typed it in a text command.
    pub fn as_raw(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::User(u) => u.0.to_string(),
            Self::Channel(c) => c.0.to_string(),
            Self::Role(r) => r.0.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReactionEvent {
    pub user_id: Option<UserId>,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub guild_id: Option<GuildId>,
    pub emoji: String,
}

#[derive(Clone, Debug)]
pub struct MemberEvent {
    pub guild_id: GuildId,
    pub user: Actor,
}

#[derive(Clone, Debug)]
pub struct UnknownCommand {
    pub name: String,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub actor: Actor,
}
