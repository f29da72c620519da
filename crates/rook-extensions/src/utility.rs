//! Small standalone helpers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::{seq::SliceRandom, Rng};

use rook_core::{
    command::{handler_fn, Command, CommandHandler, InvocationContext, Param},
    convert::{ArgValue, Integer, Text},
    domain::snowflake_created_at,
    registry::{Extension, ExtensionBuilder},
    Error, Result,
};

use crate::format::humanize;

const MAX_DICE: i64 = 25;
const MAX_SIDES: i64 = 1000;

pub struct Utility;

#[async_trait]
impl Extension for Utility {
    async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()> {
        ext.command(
            Command::builder("snowflake", Arc::new(SnowflakeInfo))
                .description("Show when a Discord id was created.")
                .param(Param::named("id", "snowflake").describe("Any Discord id"))
                .build()?,
        );

        ext.command(
            Command::builder(
                "choose",
                handler_fn(|ctx| {
                    Box::pin(async move {
                        let raw = ctx.args.text("choices").unwrap_or_default();
                        let options = split_choices(raw);
                        if options.len() < 2 {
                            return Err(Error::user("Not enough choices to pick from."));
                        }
                        let picked = options
                            .choose(&mut rand::thread_rng())
                            .map(|s| s.to_string())
                            .unwrap_or_default();
                        ctx.respond(picked);
                        Ok::<(), Error>(())
                    })
                }),
            )
            .description("Pick one of several options, separated by commas or spaces.")
            .param(Param::new("choices", Text).rest())
            .build()?,
        );

        ext.command(
            Command::builder("roll", Arc::new(Roll))
                .description("Roll some dice.")
                .param(Param::new("dice", Integer).with_default(ArgValue::Integer(1)))
                .param(Param::new("sides", Integer).with_default(ArgValue::Integer(6)))
                .build()?,
        );

        ext.command(
            Command::builder(
                "paste",
                handler_fn(|ctx| {
                    Box::pin(async move {
                        let id = ctx.args.text("paste").unwrap_or_default().to_string();
                        ctx.respond(format!("<https://mystb.in/{id}>"));
                        Ok::<(), Error>(())
                    })
                }),
            )
            .description("Normalise a paste link or id.")
            .param(Param::named("paste", "paste_id"))
            .build()?,
        );

        Ok(())
    }
}

struct SnowflakeInfo;

#[async_trait]
impl CommandHandler for SnowflakeInfo {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let id = ctx.args.snowflake("id").unwrap_or_default();
        let created = snowflake_created_at(id)
            .ok_or_else(|| Error::user(format!("{id} is not a valid snowflake.")))?;

        let age = Utc::now()
            .signed_duration_since(created)
            .to_std()
            .map(|d| format!("{} ago", humanize(d)))
            .unwrap_or_else(|_| "in the future".to_string());
        ctx.respond(format!(
            "**{id}**\nCreated {} UTC ({age})",
            created.format("%Y-%m-%d %H:%M:%S")
        ));
        Ok(())
    }
}

struct Roll;

#[async_trait]
impl CommandHandler for Roll {
    async fn call(&self, ctx: &mut InvocationContext) -> Result<()> {
        let dice = ctx.args.integer("dice").unwrap_or(1);
        let sides = ctx.args.integer("sides").unwrap_or(6);
        if !(1..=MAX_DICE).contains(&dice) {
            return Err(Error::user(format!("You can roll between 1 and {MAX_DICE} dice.")));
        }
        if !(2..=MAX_SIDES).contains(&sides) {
            return Err(Error::user(format!(
                "Dice need between 2 and {MAX_SIDES} sides."
            )));
        }

        let rolls: Vec<i64> = {
            let mut rng = rand::thread_rng();
            (0..dice).map(|_| rng.gen_range(1..=sides)).collect()
        };
        ctx.respond(render_rolls(&rolls));
        Ok(())
    }
}

/// Commas win over whitespace so options can contain spaces.
fn split_choices(raw: &str) -> Vec<&str> {
    let parts: Vec<&str> = if raw.contains(',') {
        raw.split(',').collect()
    } else {
        raw.split_whitespace().collect()
    };
    parts.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn render_rolls(rolls: &[i64]) -> String {
    match rolls {
        [one] => format!("You rolled **{one}**."),
        _ => {
            let total: i64 = rolls.iter().sum();
            let each = rolls.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
            format!("You rolled {each} (total **{total}**).")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[test]
    fn choices_split_on_commas_before_whitespace() {
        assert_eq!(split_choices("tea, hot coffee ,, "), vec!["tea", "hot coffee"]);
        assert_eq!(split_choices("red  green blue"), vec!["red", "green", "blue"]);
        assert!(split_choices("   ").is_empty());
    }

    #[test]
    fn rolls_render_totals_only_for_several_dice() {
        assert_eq!(render_rolls(&[4]), "You rolled **4**.");
        assert_eq!(render_rolls(&[1, 6, 3]), "You rolled 1, 6, 3 (total **10**).");
    }

    #[tokio::test]
    async fn snowflake_reports_creation_time() {
        let h = Harness::new(&["utility"]).await;

        // 2016-04-30 11:18:25.796 UTC
        h.say(1, "?snowflake 175928847299117063").await;
        let text = h.responder.texts().pop().unwrap();
        assert!(text.starts_with("**175928847299117063**"), "{text}");
        assert!(text.contains("Created 2016-04-30 11:18:25 UTC"), "{text}");
        assert!(text.ends_with(" ago)"), "{text}");
    }

    #[tokio::test]
    async fn choose_needs_two_options() {
        let h = Harness::new(&["utility"]).await;

        h.say(1, "?choose tea").await;
        assert_eq!(h.responder.texts(), vec!["Not enough choices to pick from."]);

        h.responder.clear();
        h.say(1, "?choose tea, coffee").await;
        let picked = h.responder.texts().pop().unwrap();
        assert!(picked == "tea" || picked == "coffee", "{picked}");
    }

    #[tokio::test]
    async fn roll_defaults_to_one_six_sided_die() {
        let h = Harness::new(&["utility"]).await;

        h.say(1, "?roll").await;
        let text = h.responder.texts().pop().unwrap();
        let value: i64 = text
            .trim_start_matches("You rolled **")
            .trim_end_matches("**.")
            .parse()
            .unwrap();
        assert!((1..=6).contains(&value));

        h.responder.clear();
        h.say(1, "?roll 26").await;
        assert_eq!(h.responder.texts(), vec!["You can roll between 1 and 25 dice."]);
    }

    #[tokio::test]
    async fn paste_accepts_links_and_bare_ids() {
        let h = Harness::new(&["utility"]).await;

        h.say(1, "?paste https://mystb.in/ExcitingRedPanda.rs").await;
        h.say(1, "?paste ExcitingRedPanda").await;
        assert_eq!(
            h.responder.texts(),
            vec![
                "<https://mystb.in/ExcitingRedPanda>",
                "<https://mystb.in/ExcitingRedPanda>"
            ]
        );
    }
}
