use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    messaging::{
        port::Responder,
        types::{Reply, ReplyTarget},
    },
    Error, Result,
};

/// Responder that keeps every payload in memory.
///
/// Used by tests and dry runs; it never touches the network.
#[derive(Default)]
pub struct RecordingResponder {
    sent: Mutex<Vec<(ReplyTarget, Reply)>>,
}

impl RecordingResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(ReplyTarget, Reply)> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Plain text of every payload, in send order.
    pub fn texts(&self) -> Vec<String> {
        self.sent().iter().map(|(_, r)| r.plain_text()).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut v) = self.sent.lock() {
            v.clear();
        }
    }
}

#[async_trait]
impl Responder for RecordingResponder {
    async fn send(&self, target: &ReplyTarget, reply: &Reply) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| Error::External("recording responder poisoned".to_string()))?
            .push((target.clone(), reply.clone()));
        Ok(())
    }
}
