//! Discord adapter (serenity).
//!
//! Converts gateway events into `rook-core` events and implements the core's
//! `Responder` port over the Discord REST API.

use std::sync::Arc;

use serenity::all::{Client, GatewayIntents, ShardManager};
use tokio::sync::mpsc;

pub mod commands;
pub mod gateway;
pub mod responder;

use rook_core::{events::GatewayEvent, registry::ExtensionRegistry};

pub use gateway::DiscordGateway;
pub use responder::SerenityResponder;

/// Bound of the gateway -> dispatcher queue.
pub const EVENT_QUEUE: usize = 256;

pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::GUILD_MEMBERS
}

/// A connected (not yet started) client plus the pieces the binary needs.
pub struct Connection {
    pub client: Client,
    pub shard_manager: Arc<ShardManager>,
    pub events: mpsc::Receiver<GatewayEvent>,
}

/// Build the gateway client. Slash commands are synced from `registry` on
/// every READY.
pub async fn connect(token: &str, registry: ExtensionRegistry) -> anyhow::Result<Connection> {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let handler = DiscordGateway::new(tx).with_registry(registry);

    let client = Client::builder(token, intents())
        .event_handler(handler)
        .await?;

    Ok(Connection {
        shard_manager: client.shard_manager.clone(),
        client,
        events: rx,
    })
}
