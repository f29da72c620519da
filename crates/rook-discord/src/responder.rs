//! `Responder` over the Discord REST API.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use serenity::all::{
    CreateEmbed, CreateEmbedFooter, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage, CreateMessage, Http,
};
use tokio::sync::Mutex;

use rook_core::{
    errors::Error,
    messaging::{
        port::Responder,
        types::{Embed, Reply, ReplyTarget},
    },
    Result,
};

/// Interaction ids remembered to decide between callback and follow-up.
const ANSWERED_CAPACITY: usize = 1024;

pub struct SerenityResponder {
    http: Arc<Http>,
    answered: Mutex<HashSet<u64>>,
}

impl SerenityResponder {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            answered: Mutex::new(HashSet::new()),
        }
    }

    /// A responder with its own REST client; usable before the gateway connects.
    pub fn from_token(token: &str) -> Self {
        Self::new(Arc::new(Http::new(token)))
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }

    fn map_err(e: serenity::Error) -> Error {
        Error::External(format!("discord error: {e}"))
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = serenity::Result<T>>,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(serenity::Error::Http(e)) if attempts < MAX_RETRIES && is_transient(&e) => {
                    attempts += 1;
                    tracing::debug!("retrying discord request: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(Self::map_err(e)),
            }
        }
    }

    /// First call for an interaction answers the callback; later calls follow up.
    async fn first_answer(&self, interaction: u64) -> bool {
        let mut answered = self.answered.lock().await;
        if answered.len() >= ANSWERED_CAPACITY {
            answered.clear();
        }
        answered.insert(interaction)
    }
}

fn is_transient(e: &serenity::http::HttpError) -> bool {
    match e {
        serenity::http::HttpError::UnsuccessfulRequest(resp) => resp.status_code.is_server_error(),
        _ => false,
    }
}

fn embed(e: &Embed) -> CreateEmbed {
    let mut out = CreateEmbed::new();
    if let Some(t) = &e.title {
        out = out.title(t);
    }
    if let Some(d) = &e.description {
        out = out.description(d);
    }
    for f in &e.fields {
        out = out.field(&f.name, &f.value, f.inline);
    }
    if let Some(footer) = &e.footer {
        out = out.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(c) = e.colour {
        out = out.colour(c);
    }
    out
}

#[async_trait]
impl Responder for SerenityResponder {
    async fn send(&self, target: &ReplyTarget, reply: &Reply) -> Result<()> {
        match target {
            ReplyTarget::Channel(channel) => {
                let channel = serenity::all::ChannelId::new(channel.0);
                self.with_retry(|| {
                    let mut msg = CreateMessage::new();
                    if let Some(c) = &reply.content {
                        msg = msg.content(c);
                    }
                    if let Some(e) = &reply.embed {
                        msg = msg.embed(embed(e));
                    }
                    channel.send_message(&*self.http, msg)
                })
                .await?;
            }
            ReplyTarget::Interaction { id, token } => {
                if self.first_answer(id.0).await {
                    let mut msg = CreateInteractionResponseMessage::new().ephemeral(reply.ephemeral);
                    if let Some(c) = &reply.content {
                        msg = msg.content(c);
                    }
                    if let Some(e) = &reply.embed {
                        msg = msg.embed(embed(e));
                    }
                    let response = CreateInteractionResponse::Message(msg);
                    let interaction = serenity::all::InteractionId::new(id.0);
                    self.with_retry(|| {
                        self.http
                            .create_interaction_response(interaction, token, &response, Vec::new())
                    })
                    .await?;
                } else {
                    let mut msg = CreateInteractionResponseFollowup::new().ephemeral(reply.ephemeral);
                    if let Some(c) = &reply.content {
                        msg = msg.content(c);
                    }
                    if let Some(e) = &reply.embed {
                        msg = msg.embed(embed(e));
                    }
                    self.with_retry(|| self.http.create_followup_message(token, &msg, Vec::new()))
                        .await?;
                }
            }
        }
        Ok(())
    }
}
