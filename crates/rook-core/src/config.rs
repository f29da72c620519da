use std::{env, path::PathBuf, time::Duration};

use crate::{
    cooldown::{BucketScope, CooldownPolicy},
    domain::{ChannelId, UserId},
    errors::Error,
    Result,
};

/// Static startup configuration.
#[derive(Clone, Debug)]
pub struct Config {
    // Gateway
    pub discord_token: String,

    // Commands
    pub command_prefixes: Vec<String>,
    pub case_insensitive_commands: bool,
    pub default_cooldown: Option<CooldownPolicy>,
    pub cooldown_retention_periods: u32,

    // Extensions
    pub autoload_extensions: Vec<String>,

    // Privileged users / operator reporting
    pub owner_ids: Vec<UserId>,
    pub operator_channel: Option<ChannelId>,

    // Storage + lifecycle
    pub data_dir: PathBuf,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Defaults for everything except the token.
    pub fn new(discord_token: impl Into<String>) -> Self {
        Self {
            discord_token: discord_token.into(),
            command_prefixes: vec!["?".to_string()],
            case_insensitive_commands: false,
            default_cooldown: Some(CooldownPolicy::new(
                5,
                Duration::from_secs(10),
                BucketScope::User,
            )),
            cooldown_retention_periods: 3,
            autoload_extensions: vec![
                "meta".to_string(),
                "utility".to_string(),
                "reminders".to_string(),
            ],
            owner_ids: Vec::new(),
            operator_channel: None,
            data_dir: PathBuf::from("data"),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn load() -> Result<Self> {
        // Existing environment always wins over `.env`.
        let _ = dotenvy::dotenv();

        let discord_token = env_str("DISCORD_TOKEN").unwrap_or_default();
        if discord_token.trim().is_empty() {
            return Err(Error::Config(
                "DISCORD_TOKEN environment variable is required".to_string(),
            ));
        }

        let mut cfg = Self::new(discord_token.trim());

        if let Some(prefixes) = env_str("BOT_PREFIXES") {
            let prefixes = parse_csv(&prefixes);
            if prefixes.is_empty() {
                return Err(Error::Config(
                    "BOT_PREFIXES must name at least one prefix".to_string(),
                ));
            }
            cfg.command_prefixes = prefixes;
        }
        if let Some(v) = env_bool("CASE_INSENSITIVE_COMMANDS") {
            cfg.case_insensitive_commands = v;
        }

        // Cooldown defaults (rate 0 disables the default policy).
        let rate = env_parse::<u32>("COOLDOWN_RATE")?.unwrap_or(5);
        let per = env_parse::<u64>("COOLDOWN_PER_SECS")?.unwrap_or(10);
        let scope = match env_str("COOLDOWN_SCOPE") {
            Some(s) => s.parse::<BucketScope>()?,
            None => BucketScope::User,
        };
        cfg.default_cooldown = if rate == 0 || per == 0 {
            None
        } else {
            Some(CooldownPolicy::new(rate, Duration::from_secs(per), scope))
        };
        if let Some(periods) = env_parse::<u32>("COOLDOWN_RETENTION_PERIODS")? {
            cfg.cooldown_retention_periods = periods.max(1);
        }

        if let Some(exts) = env_str("BOT_EXTENSIONS") {
            cfg.autoload_extensions = parse_csv(&exts);
        }

        if let Some(owners) = env_str("BOT_OWNERS") {
            cfg.owner_ids = parse_csv(&owners)
                .iter()
                .map(|s| {
                    s.parse::<u64>()
                        .map(UserId)
                        .map_err(|_| Error::Config(format!("invalid owner id in BOT_OWNERS: {s}")))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        cfg.operator_channel = env_parse::<u64>("OPERATOR_CHANNEL_ID")?.map(ChannelId);

        if let Some(dir) = env::var_os("DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_parse::<u64>("SHUTDOWN_GRACE_MS")? {
            cfg.shutdown_grace = Duration::from_millis(ms);
        }

        Ok(cfg)
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.owner_ids.contains(&user)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    let Some(raw) = env_str(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}")))
}

fn parse_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
