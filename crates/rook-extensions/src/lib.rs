//! Built-in extensions shipped with the bot.

use std::sync::Arc;

use rook_core::registry::{Extension, ExtensionCatalog};

mod format;
pub mod meta;
pub mod reminders;
pub mod utility;

/// Every extension this crate provides, by load name.
pub fn catalog() -> ExtensionCatalog {
    ExtensionCatalog::new()
        .with("meta", || Arc::new(meta::Meta) as Arc<dyn Extension>)
        .with("utility", || Arc::new(utility::Utility) as Arc<dyn Extension>)
        .with("reminders", || Arc::new(reminders::Reminders) as Arc<dyn Extension>)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use rook_core::{
        bot::{Bot, Services},
        config::Config,
        domain::{Actor, ChannelId, MessageId, UserId},
        events::{GatewayEvent, IncomingMessage},
        messaging::recording::RecordingResponder,
        store::MemoryStore,
    };

    pub struct Harness {
        pub bot: Bot,
        pub services: Arc<Services>,
        pub responder: Arc<RecordingResponder>,
    }

    impl Harness {
        pub const OWNER: u64 = 100;
        pub const CHANNEL: ChannelId = ChannelId(7);

        pub async fn new(extensions: &[&str]) -> Self {
            let mut config = Config::new("token");
            config.autoload_extensions = extensions.iter().map(|s| s.to_string()).collect();
            config.owner_ids = vec![UserId(Self::OWNER)];
            config.default_cooldown = None;

            let responder = Arc::new(RecordingResponder::new());
            let services = Services::new(
                config,
                responder.clone(),
                Arc::new(MemoryStore::new()),
                super::catalog(),
            );
            let bot = Bot::new(services.clone());
            let report = bot.start().await.unwrap();
            assert!(report.failed.is_empty(), "{:?}", report.failed);

            Self {
                bot,
                services,
                responder,
            }
        }

        /// Send a message as `user` and wait for any invocation it starts.
        pub async fn say(&self, user: u64, content: &str) {
            let event = GatewayEvent::MessageCreate(IncomingMessage {
                id: MessageId(1),
                channel_id: Self::CHANNEL,
                guild_id: None,
                author: Actor {
                    id: UserId(user),
                    name: format!("user{user}"),
                    bot: false,
                },
                content: content.into(),
                nsfw_channel: false,
                author_permissions: None,
            });
            let outcome = self.bot.dispatcher().dispatch(event).await;
            if let Some(inv) = outcome.invocation() {
                inv.finished().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_knows_the_default_autoload_set() {
        let names = catalog().names();
        for name in rook_core::config::Config::new("t").autoload_extensions {
            assert!(names.contains(&name), "{name} missing from catalog");
        }
    }

    #[tokio::test]
    async fn all_extensions_load_together() {
        let h = testing::Harness::new(&["meta", "utility", "reminders"]).await;
        assert!(h.services.registry.resolve("reminders list").is_some());
        assert!(h.services.registry.resolve("extension reload").is_some());
    }
}
