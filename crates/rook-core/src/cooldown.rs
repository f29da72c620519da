//! Per-command, per-scope cooldowns (token buckets).
//!
//! Refill is lazy: tokens are recomputed from the elapsed time at acquisition,
//! so there is no timer per bucket. Idle buckets are swept opportunistically;
//! dropping one only resets it to full capacity.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

use crate::{
    domain::{ChannelId, GuildId, UserId},
    errors::Error,
    Result,
};

/// Run a sweep every this many acquisitions.
const SWEEP_EVERY: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketScope {
    User,
    Channel,
    Guild,
    Global,
}

impl FromStr for BucketScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" | "member" => Ok(Self::User),
            "channel" => Ok(Self::Channel),
            "guild" | "server" => Ok(Self::Guild),
            "global" | "default" => Ok(Self::Global),
            other => Err(Error::Config(format!("unknown cooldown scope: {other}"))),
        }
    }
}

/// `rate` invocations per `per`, counted per `scope`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub rate: u32,
    pub per: Duration,
    pub scope: BucketScope,
}

impl CooldownPolicy {
    pub fn new(rate: u32, per: Duration, scope: BucketScope) -> Self {
        Self {
            rate: rate.max(1),
            per,
            scope,
        }
    }

    /// Time to refill a single token.
    fn interval(&self) -> Duration {
        self.per / self.rate.max(1)
    }
}

/// How a command picks its cooldown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CooldownSetting {
    /// Use the configured default policy.
    #[default]
    Default,
    Disabled,
    Custom(CooldownPolicy),
}

impl CooldownSetting {
    pub fn resolve(self, default: Option<CooldownPolicy>) -> Option<CooldownPolicy> {
        match self {
            Self::Default => default,
            Self::Disabled => None,
            Self::Custom(p) => Some(p),
        }
    }
}

/// Bucket key within a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    User(UserId),
    Channel(ChannelId),
    Guild(GuildId),
    Global,
}

impl ScopeKey {
    /// Guild scope falls back to the channel outside of guilds (DMs).
    pub fn for_scope(
        scope: BucketScope,
        user: UserId,
        channel: ChannelId,
        guild: Option<GuildId>,
    ) -> Self {
        match scope {
            BucketScope::User => Self::User(user),
            BucketScope::Channel => Self::Channel(channel),
            BucketScope::Guild => guild.map(Self::Guild).unwrap_or(Self::Channel(channel)),
            BucketScope::Global => Self::Global,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Admitted,
    Denied { retry_after: Duration },
}

#[derive(Clone, Debug)]
struct Bucket {
    tokens: u32,
    capacity: u32,
    interval: Duration,
    per: Duration,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn full(policy: &CooldownPolicy, now: Instant) -> Self {
        Self {
            tokens: policy.rate,
            capacity: policy.rate,
            interval: policy.interval(),
            per: policy.per,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.tokens >= self.capacity {
            self.last_refill = now;
            return;
        }
        let interval_ns = self.interval.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.last_refill);
        let gained = elapsed.as_nanos() / interval_ns;
        if gained == 0 {
            return;
        }
        let gained = u32::try_from(gained).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(gained).min(self.capacity);
        if self.tokens >= self.capacity {
            self.last_refill = now;
        } else {
            self.last_refill += self.interval * gained;
        }
    }

    fn retry_after(&self, now: Instant) -> Duration {
        let next = self.last_refill + self.interval;
        next.saturating_duration_since(now)
    }
}

/// Tracks every cooldown bucket, keyed by (command, scope key).
pub struct CooldownTracker {
    buckets: Mutex<HashMap<(String, ScopeKey), Bucket>>,
    retention_periods: u32,
    acquisitions: AtomicU64,
}

impl CooldownTracker {
    /// `retention_periods`: idle buckets older than this many refill periods may be swept.
    pub fn new(retention_periods: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            retention_periods: retention_periods.max(1),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub async fn try_acquire(
        &self,
        command: &str,
        key: ScopeKey,
        policy: &CooldownPolicy,
    ) -> Acquire {
        self.try_acquire_at(command, key, policy, Instant::now())
            .await
    }

    pub async fn try_acquire_at(
        &self,
        command: &str,
        key: ScopeKey,
        policy: &CooldownPolicy,
        now: Instant,
    ) -> Acquire {
        let mut buckets = self.buckets.lock().await;

        let n = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        if n % SWEEP_EVERY == 0 {
            let removed = sweep_locked(&mut buckets, self.retention_periods, now);
            if removed > 0 {
                tracing::debug!(removed, "swept idle cooldown buckets");
            }
        }

        let bucket = buckets
            .entry((command.to_string(), key))
            .or_insert_with(|| Bucket::full(policy, now));

        // A command whose policy changed (reload) starts over with the new shape.
        if bucket.capacity != policy.rate || bucket.per != policy.per {
            *bucket = Bucket::full(policy, now);
        }

        bucket.refill(now);
        bucket.last_used = now;

        if bucket.tokens >= 1 {
            bucket.tokens -= 1;
            return Acquire::Admitted;
        }

        Acquire::Denied {
            retry_after: bucket.retry_after(now),
        }
    }

    /// Tokens currently held by a bucket, or `None` when it does not exist (full).
    pub async fn tokens(&self, command: &str, key: ScopeKey) -> Option<u32> {
        self.tokens_at(command, key, Instant::now()).await
    }

    pub async fn tokens_at(&self, command: &str, key: ScopeKey, now: Instant) -> Option<u32> {
        let buckets = self.buckets.lock().await;
        buckets.get(&(command.to_string(), key)).map(|b| {
            let mut b = b.clone();
            b.refill(now);
            b.tokens
        })
    }

    /// Drop buckets untouched for longer than the retention window.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().await;
        sweep_locked(&mut buckets, self.retention_periods, now)
    }

    /// Forget every bucket of a command (used when its extension unloads).
    pub async fn forget_command(&self, command: &str) {
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|(name, _), _| name != command);
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }
}

fn sweep_locked(
    buckets: &mut HashMap<(String, ScopeKey), Bucket>,
    retention_periods: u32,
    now: Instant,
) -> usize {
    let before = buckets.len();
    buckets.retain(|_, b| {
        let retention = b.per.saturating_mul(retention_periods);
        now.saturating_duration_since(b.last_used) <= retention
    });
    before - buckets.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rate: u32, secs: u64) -> CooldownPolicy {
        CooldownPolicy::new(rate, Duration::from_secs(secs), BucketScope::User)
    }

    #[tokio::test]
    async fn capacity_one_denies_then_refills() {
        let t = CooldownTracker::new(3);
        let p = policy(1, 10);
        let key = ScopeKey::User(UserId(1));
        let start = Instant::now();

        assert_eq!(t.try_acquire_at("ping", key, &p, start).await, Acquire::Admitted);

        match t
            .try_acquire_at("ping", key, &p, start + Duration::from_secs(1))
            .await
        {
            Acquire::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(9)),
            other => panic!("expected denial, got {other:?}"),
        }

        assert_eq!(
            t.try_acquire_at("ping", key, &p, start + Duration::from_secs(10))
                .await,
            Acquire::Admitted
        );
    }

    #[tokio::test]
    async fn burst_capacity_and_partial_refill() {
        let t = CooldownTracker::new(3);
        let p = policy(2, 10);
        let key = ScopeKey::Global;
        let start = Instant::now();

        assert_eq!(t.try_acquire_at("roll", key, &p, start).await, Acquire::Admitted);
        assert_eq!(t.try_acquire_at("roll", key, &p, start).await, Acquire::Admitted);
        assert!(matches!(
            t.try_acquire_at("roll", key, &p, start).await,
            Acquire::Denied { .. }
        ));

        // One token every 5s.
        let later = start + Duration::from_secs(5);
        assert_eq!(t.tokens_at("roll", key, later).await, Some(1));
        assert_eq!(t.try_acquire_at("roll", key, &p, later).await, Acquire::Admitted);
        assert_eq!(t.tokens_at("roll", key, later).await, Some(0));
    }

    #[tokio::test]
    async fn scopes_do_not_share_buckets() {
        let t = CooldownTracker::new(3);
        let p = policy(1, 60);
        let now = Instant::now();

        assert_eq!(
            t.try_acquire_at("x", ScopeKey::User(UserId(1)), &p, now).await,
            Acquire::Admitted
        );
        assert_eq!(
            t.try_acquire_at("x", ScopeKey::User(UserId(2)), &p, now).await,
            Acquire::Admitted
        );
        assert_eq!(
            t.try_acquire_at("y", ScopeKey::User(UserId(1)), &p, now).await,
            Acquire::Admitted
        );
    }

    #[tokio::test]
    async fn sweep_drops_only_idle_buckets() {
        let t = CooldownTracker::new(3);
        let p = policy(1, 10);
        let start = Instant::now();

        t.try_acquire_at("a", ScopeKey::Global, &p, start).await;
        t.try_acquire_at("b", ScopeKey::Global, &p, start + Duration::from_secs(25))
            .await;

        let removed = t.sweep_at(start + Duration::from_secs(31)).await;
        assert_eq!(removed, 1);
        assert_eq!(t.len().await, 1);
        assert_eq!(t.tokens_at("a", ScopeKey::Global, start).await, None);
    }

    #[test]
    fn guild_scope_falls_back_to_channel_in_dms() {
        let key = ScopeKey::for_scope(BucketScope::Guild, UserId(1), ChannelId(9), None);
        assert_eq!(key, ScopeKey::Channel(ChannelId(9)));
        assert_eq!("server".parse::<BucketScope>().unwrap(), BucketScope::Guild);
        assert!("planet".parse::<BucketScope>().is_err());
    }
}
