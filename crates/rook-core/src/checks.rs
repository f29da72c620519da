//! Check predicates gating an invocation.
//!
//! Checks run in declaration order before any cooldown token is spent; the
//! first failure short-circuits the pipeline.

use async_trait::async_trait;

use crate::{command::InvocationContext, domain::Permissions, errors::CheckFailure};

pub type CheckResult = std::result::Result<(), CheckFailure>;

#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, ctx: &InvocationContext) -> CheckResult;
}

fn fail(check: &str, reason: impl Into<String>) -> CheckResult {
    Err(CheckFailure {
        check: check.to_string(),
        reason: reason.into(),
    })
}

pub struct GuildOnly;

#[async_trait]
impl Check for GuildOnly {
    fn name(&self) -> &str {
        "guild_only"
    }

    async fn check(&self, ctx: &InvocationContext) -> CheckResult {
        if ctx.in_guild() {
            Ok(())
        } else {
            fail(self.name(), "This command cannot be used in private messages.")
        }
    }
}

pub struct DmOnly;

#[async_trait]
impl Check for DmOnly {
    fn name(&self) -> &str {
        "dm_only"
    }

    async fn check(&self, ctx: &InvocationContext) -> CheckResult {
        if ctx.in_guild() {
            fail(self.name(), "This command can only be used in private messages.")
        } else {
            Ok(())
        }
    }
}

pub struct OwnerOnly;

#[async_trait]
impl Check for OwnerOnly {
    fn name(&self) -> &str {
        "owner_only"
    }

    async fn check(&self, ctx: &InvocationContext) -> CheckResult {
        if ctx.is_owner() {
            Ok(())
        } else {
            fail(self.name(), "You do not own this bot.")
        }
    }
}

/// NSFW channels only. Private messages count as NSFW-capable.
pub struct NsfwOnly;

#[async_trait]
impl Check for NsfwOnly {
    fn name(&self) -> &str {
        "nsfw_only"
    }

    async fn check(&self, ctx: &InvocationContext) -> CheckResult {
        if !ctx.in_guild() || ctx.nsfw_channel {
            Ok(())
        } else {
            fail(
                self.name(),
                "You cannot use this command in a non-NSFW channel.",
            )
        }
    }
}

/// The invoking member must hold every listed permission in the channel.
pub struct HasPermissions(pub Permissions);

#[async_trait]
impl Check for HasPermissions {
    fn name(&self) -> &str {
        "has_permissions"
    }

    async fn check(&self, ctx: &InvocationContext) -> CheckResult {
        let Some(held) = ctx.permissions else {
            return fail(self.name(), "This command cannot be used in private messages.");
        };
        if held.satisfies(self.0) {
            return Ok(());
        }
        let missing = self.0.difference(held);
        fail(
            self.name(),
            format!(
                "You are missing {} permission(s) to run this command.",
                permission_names(missing)
            ),
        )
    }
}

/// A synchronous predicate; `Err` carries the reason.
pub struct FnCheck<F> {
    name: String,
    predicate: F,
}

pub fn check_fn<F>(name: impl Into<String>, predicate: F) -> FnCheck<F>
where
    F: Fn(&InvocationContext) -> std::result::Result<(), String> + Send + Sync,
{
    FnCheck {
        name: name.into(),
        predicate,
    }
}

#[async_trait]
impl<F> Check for FnCheck<F>
where
    F: Fn(&InvocationContext) -> std::result::Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, ctx: &InvocationContext) -> CheckResult {
        (self.predicate)(ctx).or_else(|reason| fail(&self.name, reason))
    }
}

/// `BAN_MEMBERS | MANAGE_GUILD` -> `"Ban Members and Manage Guild"`.
pub fn permission_names(perms: Permissions) -> String {
    let names: Vec<String> = perms
        .iter_names()
        .map(|(name, _)| {
            name.split('_')
                .map(|w| {
                    let mut chars = w.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_string() + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    match names.as_slice() {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_names_are_humanized() {
        assert_eq!(permission_names(Permissions::BAN_MEMBERS), "Ban Members");
        assert_eq!(
            permission_names(
                Permissions::KICK_MEMBERS | Permissions::BAN_MEMBERS | Permissions::MANAGE_GUILD
            ),
            "Kick Members, Ban Members and Manage Guild"
        );
    }
}
