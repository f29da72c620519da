use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds between the Unix epoch and the first second of 2015 (snowflake epoch).
pub const SNOWFLAKE_EPOCH_MS: u64 = 1_420_070_400_000;

/// Discord user id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

/// Discord channel id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// Discord guild (server) id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuildId(pub u64);

/// Discord role id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleId(pub u64);

/// Discord message id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// Discord interaction id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InteractionId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(UserId, ChannelId, GuildId, RoleId, MessageId, InteractionId);

/// Creation time encoded in the upper bits of a snowflake id.
pub fn snowflake_created_at(id: u64) -> Option<DateTime<Utc>> {
    let ms = (id >> 22).checked_add(SNOWFLAKE_EPOCH_MS)?;
    Utc.timestamp_millis_opt(i64::try_from(ms).ok()?).single()
}

/// The user behind an event or invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub name: String,
    pub bot: bool,
}

bitflags::bitflags! {
    /// Subset of guild permission bits used by the built-in checks.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Permissions: u64 {
        const KICK_MEMBERS = 1 << 1;
        const BAN_MEMBERS = 1 << 2;
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_GUILD = 1 << 5;
        const ADD_REACTIONS = 1 << 6;
        const SEND_MESSAGES = 1 << 11;
        const MANAGE_MESSAGES = 1 << 13;
        const EMBED_LINKS = 1 << 14;
        const ATTACH_FILES = 1 << 15;
        const MENTION_EVERYONE = 1 << 17;
        const MANAGE_ROLES = 1 << 28;
        const MODERATE_MEMBERS = 1 << 40;
    }
}

impl Permissions {
    /// Administrators implicitly hold every permission.
    pub fn satisfies(self, required: Permissions) -> bool {
        self.contains(Permissions::ADMINISTRATOR) || self.contains(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn snowflake_timestamp_decodes() {
        // 175928847299117063 is the canonical example id from the API docs.
        let dt = snowflake_created_at(175_928_847_299_117_063).unwrap();
        assert_eq!(dt.year(), 2016);
        assert_eq!(dt.timestamp_millis(), 1_462_015_105_796);
    }

    #[test]
    fn administrator_satisfies_everything() {
        let admin = Permissions::ADMINISTRATOR;
        assert!(admin.satisfies(Permissions::BAN_MEMBERS | Permissions::MANAGE_GUILD));
        assert!(!Permissions::KICK_MEMBERS.satisfies(Permissions::BAN_MEMBERS));
    }
}
