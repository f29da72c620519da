//! Reminders backed by the task scheduler.
//!
//! `?remind me to stretch in 20m`, `?remind 2h, laundry`, `?reminders list`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use rook_core::{
    command::{Command, CommandHandler, InvocationContext, Param},
    convert::{parse_duration, parse_duration_prefix, Text},
    domain::{ChannelId, UserId},
    messaging::types::{Reply, ReplyTarget},
    paginator::{ListPages, PageCursor},
    registry::{Extension, ExtensionBuilder},
    scheduler::{NewTask, RetryPolicy, ScheduledTask, TaskContext, TaskHandler},
    Error, Result,
};

use crate::format::humanize;

pub const TASK_KIND: &str = "reminder";

const LIST_PER_PAGE: usize = 10;
const PREVIEW_CHARS: usize = 60;

/// Stored with each reminder task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub message: String,
}

pub struct Reminders;

#[async_trait]
impl Extension for Reminders {
    async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
        ext.task_handler(TASK_KIND, Arc::new(Deliver));

        ext.command(
            Command::builder("remind", Arc::new(Remind))
                .alias("remindme")
                .description("Set a reminder, e.g. `remind me to stretch in 20m`.")
                .param(Param::new("when", Text).rest().describe("When and what"))
                .build()?,
        );
        ext.command(
            Command::builder("reminders list", Arc::new(List))
                .description("Show your pending reminders.")
                .param(Param::new("page", Text).optional().describe("Page number"))
                .build()?,
        );
        ext.command(
            Command::builder("reminders cancel", Arc::new(Cancel))
                .alias("reminders delete")
                .description("Cancel one of your reminders.")
                .param(Param::new("id", Text).describe("Reminder id"))
                .build()?,
        );
        Ok(())
    }
}

struct Remind;

#[async_trait]
impl CommandHandler for Remind {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let raw = ctx.args.text("when").unwrap_or_default();
        let (delay, message) = parse_when_and_what(raw).map_err(Error::user)?;

        let payload = ReminderPayload {
            channel_id: ctx.channel_id,
            user_id: ctx.actor.id,
            message,
        };
        let task = NewTask::after(TASK_KIND, delay, serde_json::to_value(&payload)?)
            .retry(RetryPolicy::new(3, Duration::from_secs(30)));
        let task = ctx.services.scheduler.schedule(task).await?;

        tracing::info!(task_id = %task.id, user = %payload.user_id, "reminder set");
        ctx.respond(format!(
            "Alright, in {}: {} (reminder {})",
            humanize(delay),
            payload.message,
            task.id
        ));
        Ok(())
    }
}

struct List;

#[async_trait]
impl CommandHandler for List {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let now = Utc::now();
        let mine: Vec<String> = ctx
            .services
            .scheduler
            .pending()
            .await
            .into_iter()
            .filter_map(|task| owned_by(&task, ctx.actor.id).map(|p| (task, p)))
            .map(|(task, p)| {
                let left = (task.due_at - now).to_std().unwrap_or_default();
                format!("`{}` in {}: {}", task.id, humanize(left), preview(&p.message))
            })
            .collect();

        let pages = ListPages::new(mine, LIST_PER_PAGE);
        if pages.is_empty() {
            ctx.respond("You have no pending reminders.");
            return Ok(());
        }
        let mut cursor = PageCursor::new(Some(pages.max_pages()));
        let page = cursor
            .goto_number(ctx.args.text("page").unwrap_or("1"))
            .map_err(Error::user)?;

        let mut body = pages.render(page).unwrap_or_default();
        if let Some(footer) = pages.footer(page) {
            body.push_str("\n\n");
            body.push_str(&footer);
        }
        ctx.respond(Reply::text(body).ephemeral());
        Ok(())
    }
}

struct Cancel;

#[async_trait]
impl CommandHandler for Cancel {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let id = ctx.args.text("id").unwrap_or_default().trim().to_string();
        let not_found = || Error::user(format!("You have no reminder with id `{id}`."));

        let task = ctx.services.scheduler.get(&id).await.ok_or_else(not_found)?;
        if owned_by(&task, ctx.actor.id).is_none() {
            return Err(not_found());
        }
        ctx.services.scheduler.cancel(&id).await?;
        ctx.respond(format!("Cancelled reminder {id}."));
        Ok(())
    }
}

/// Fires a reminder into the channel it was set in.
struct Deliver;

#[async_trait]
impl TaskHandler for Deliver {
    async fn run(&self, task: &ScheduledTask, ctx: &TaskContext) -> Result<()> {
        let payload: ReminderPayload = serde_json::from_value(task.payload.clone())?;
        let ago = (Utc::now() - task.created_at).to_std().unwrap_or_default();
        let text = format!(
            "<@{}>, {} ago: {}",
            payload.user_id,
            humanize(ago),
            payload.message
        );
        ctx.responder
            .send(&ReplyTarget::Channel(payload.channel_id), &Reply::text(text))
            .await
    }
}

fn owned_by(task: &ScheduledTask, user: UserId) -> Option<ReminderPayload> {
    if task.kind != TASK_KIND {
        return None;
    }
    serde_json::from_value::<ReminderPayload>(task.payload.clone())
        .ok()
        .filter(|p| p.user_id == user)
}

fn preview(message: &str) -> String {
    if message.chars().count() <= PREVIEW_CHARS {
        return message.to_string();
    }
    let mut out: String = message.chars().take(PREVIEW_CHARS).collect();
    out.push('…');
    out
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn strip_suffix_ci<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = s.len().checked_sub(suffix.len())?;
    let tail = s.get(cut..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &s[..cut])
}

/// Split `"me to <what> in <when>"` / `"<when> <what>"` into a delay and a message.
pub fn parse_when_and_what(input: &str) -> std::result::Result<(Duration, String), String> {
    let mut s = input.trim();
    for p in ["me to ", "me in ", "me at ", "me that "] {
        if let Some(rest) = strip_prefix_ci(s, p) {
            s = rest.trim_start();
            break;
        }
    }
    s = strip_prefix_ci(s, "in ").unwrap_or(s);
    s = strip_suffix_ci(s, "from now").unwrap_or(s).trim_end();

    let (delay, what) = if let Some((delay, used)) = parse_duration_prefix(s) {
        (delay, &s[used..])
    } else {
        trailing_delay(s).ok_or_else(|| {
            "I couldn't find a time in that. Try `remind me to stretch in 20m`.".to_string()
        })?
    };

    if delay.is_zero() {
        return Err("That time is not in the future.".to_string());
    }
    Ok((delay, clean_message(what)))
}

/// `"<what> in <when>"`, using the last `in` that is followed only by a duration.
fn trailing_delay(s: &str) -> Option<(Duration, &str)> {
    let lower = s.to_ascii_lowercase();
    lower.rmatch_indices(" in ").find_map(|(i, _)| {
        let delay = parse_duration(&s[i + 4..])?;
        Some((delay, &s[..i]))
    })
}

fn clean_message(what: &str) -> String {
    let what = what.trim_start_matches([' ', ',', '.', '!', ':', ';']);
    let what = strip_prefix_ci(what, "to ").unwrap_or(what).trim();
    if what.is_empty() {
        "…".to_string()
    } else {
        what.to_string()
    }
}
