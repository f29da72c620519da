use async_trait::async_trait;

use crate::{
    messaging::types::{Reply, ReplyTarget},
    Result,
};

/// Response emission port.
///
/// The core only produces payloads; network transmission (REST calls, interaction
/// callbacks) belongs to the platform adapter implementing this trait.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn send(&self, target: &ReplyTarget, reply: &Reply) -> Result<()>;
}
