//! Background task scheduler (deferred and recurring jobs such as reminders).
//!
//! - Pending tasks sit in a min-heap keyed by due time
//! - The loop sleeps until the head is due or a new task is inserted
//! - Every state change is written to the record store before it takes effect
//!   in memory, so a crash never loses a pending task
//! - Tasks found `Running` at startup were interrupted and run again
//! - Completed, failed and cancelled tasks are deleted from the store; the id
//!   high-water mark lives in its own collection so ids are never reused

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    errors::SchedulerError,
    funnel::{error_chain, ErrorFunnel, Origin},
    messaging::port::Responder,
    store::RecordStore,
    Error, Result,
};

pub const TASKS_COLLECTION: &str = "scheduled_tasks";
pub const META_COLLECTION: &str = "scheduler_meta";
const NEXT_ID_KEY: &str = "next_id";

/// A due task whose kind has no handler is looked at again after this long.
const MISSING_HANDLER_RETRY: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(3_600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Exponential backoff: `backoff_ms * 2^(attempt - 1)`, capped at one hour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// Persisted task record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Selects the handler.
    pub kind: String,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub repeat_every_secs: Option<u64>,
    pub payload: Value,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A task to be scheduled.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub kind: String,
    pub due_at: DateTime<Utc>,
    pub payload: Value,
    pub repeat_every: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl NewTask {
    pub fn at(kind: impl Into<String>, due_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            due_at,
            payload,
            repeat_every: None,
            retry: None,
        }
    }

    pub fn after(kind: impl Into<String>, delay: Duration, payload: Value) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let due_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::at(kind, due_at, payload)
    }

    /// Repeat at this interval (at least one second) after each successful run.
    pub fn every(mut self, interval: Duration) -> Self {
        self.repeat_every = Some(interval.max(Duration::from_secs(1)));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// What a task handler gets to work with.
#[derive(Clone)]
pub struct TaskContext {
    pub responder: Arc<dyn Responder>,
    pub store: Arc<dyn RecordStore>,
    /// Fires when the scheduler gives up waiting during shutdown.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &ScheduledTask, ctx: &TaskContext) -> Result<()>;
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn RecordStore>,
    responder: Arc<dyn Responder>,
    funnel: ErrorFunnel,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    state: Mutex<State>,
    wake: Notify,
    /// Stops the loop from starting new work.
    stop: CancellationToken,
    /// Aborts in-flight executions.
    abort: CancellationToken,
    tracker: TaskTracker,
    seq: AtomicU64,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<QueueEntry>>,
    /// Pending and running tasks. Terminal tasks live only in the store.
    slots: HashMap<String, Slot>,
    next_id: Option<u64>,
    started: bool,
}

struct Slot {
    task: ScheduledTask,
    /// Sequence of the live queue entry; older entries are stale.
    seq: u64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    due: DateTime<Utc>,
    seq: u64,
    id: String,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        responder: Arc<dyn Responder>,
        funnel: ErrorFunnel,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                responder,
                funnel,
                handlers: RwLock::new(HashMap::new()),
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
                tracker: TaskTracker::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    // ============== Handlers ==============

    pub fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let kind = kind.into();
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.insert(kind.clone(), handler);
        }

        // Tasks deferred for lack of a handler become eligible right away.
        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            scheduler.requeue_kind(&kind).await;
        });
    }

    pub fn unregister_handler(&self, kind: &str) -> bool {
        self.inner
            .handlers
            .write()
            .map(|mut h| h.remove(kind).is_some())
            .unwrap_or(false)
    }

    pub fn has_handler(&self, kind: &str) -> bool {
        self.handler(kind).is_some()
    }

    fn handler(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.inner
            .handlers
            .read()
            .ok()
            .and_then(|h| h.get(kind).cloned())
    }

    // ============== Lifecycle ==============

    /// Reload persisted tasks and start the loop. Returns the number re-enqueued.
    pub async fn start(&self) -> Result<usize> {
        if self.inner.stop.is_cancelled() {
            return Err(SchedulerError::Stopped.into());
        }

        let mut st = self.inner.state.lock().await;
        if st.started {
            return Ok(0);
        }

        let stored_next = self.stored_next_id().await?;
        let records = self.inner.store.list(TASKS_COLLECTION).await?;
        let mut restored = 0usize;
        for (key, value) in records {
            let mut task: ScheduledTask = match serde_json::from_value(value) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(task_id = %key, "skipping unreadable task record: {e}");
                    continue;
                }
            };
            match task.status {
                TaskStatus::Pending => {}
                TaskStatus::Running => {
                    // Interrupted mid-run by a crash; run it again.
                    task.status = TaskStatus::Pending;
                    self.persist(&task).await?;
                }
                _ => {
                    // Left behind by an older build that kept finished tasks.
                    self.retire(&task.id).await?;
                    continue;
                }
            }
            if !st.slots.contains_key(&task.id) {
                self.enqueue_locked(&mut st, task.clone(), task.due_at);
                restored += 1;
            }
        }
        let next = st.next_id.unwrap_or(1).max(stored_next);
        st.next_id = Some(next);
        st.started = true;
        drop(st);

        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            scheduler.run_loop().await;
        });

        tracing::info!(restored, "scheduler started");
        Ok(restored)
    }

    /// Stop taking new work, wait up to `grace` for running tasks, abort the
    /// rest (they revert to pending) and flush everything to the store.
    pub async fn shutdown(&self, grace: Duration) -> Result<usize> {
        self.inner.stop.cancel();
        self.inner.wake.notify_one();
        self.inner.tracker.close();

        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(?grace, "scheduled tasks still running after grace period, aborting");
            self.inner.abort.cancel();
            if tokio::time::timeout(grace, self.inner.tracker.wait())
                .await
                .is_err()
            {
                tracing::error!("scheduled tasks did not stop after abort");
            }
        }

        let flushed = self.flush().await?;
        tracing::info!(flushed, "scheduler stopped");
        Ok(flushed)
    }

    /// Write every pending/running task to the store. Returns the number written.
    pub async fn flush(&self) -> Result<usize> {
        let st = self.inner.state.lock().await;
        for slot in st.slots.values() {
            self.persist(&slot.task).await?;
        }
        Ok(st.slots.len())
    }

    // ============== Operations ==============

    pub async fn schedule(&self, new: NewTask) -> Result<ScheduledTask> {
        if self.inner.stop.is_cancelled() {
            return Err(SchedulerError::Stopped.into());
        }

        let mut st = self.inner.state.lock().await;
        let id = self.next_id(&mut st).await?;
        let task = ScheduledTask {
            id: id.to_string(),
            kind: new.kind,
            due_at: new.due_at,
            repeat_every_secs: new.repeat_every.map(|d| d.as_secs().max(1)),
            payload: new.payload,
            status: TaskStatus::Pending,
            retry: new.retry,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        };

        self.persist(&task).await?;
        self.enqueue_locked(&mut st, task.clone(), task.due_at);
        drop(st);
        self.inner.wake.notify_one();

        tracing::debug!(task_id = %task.id, kind = %task.kind, due_at = %task.due_at, "task scheduled");
        Ok(task)
    }

    /// Cancel a pending task.
    pub async fn cancel(&self, id: &str) -> Result<ScheduledTask> {
        let mut st = self.inner.state.lock().await;

        match st.slots.get(id).map(|s| s.task.status) {
            Some(TaskStatus::Pending) => {
                let mut task = match st.slots.get(id) {
                    Some(slot) => slot.task.clone(),
                    None => return Err(SchedulerError::TaskNotFound(id.to_string()).into()),
                };
                task.status = TaskStatus::Cancelled;
                self.retire(id).await?;
                st.slots.remove(id);
                tracing::debug!(task_id = %id, "task cancelled");
                Ok(task)
            }
            Some(status) => Err(SchedulerError::InvalidState {
                task_id: id.to_string(),
                status: status.to_string(),
            }
            .into()),
            None => Err(SchedulerError::TaskNotFound(id.to_string()).into()),
        }
    }

    /// Pending tasks ordered by due time.
    pub async fn pending(&self) -> Vec<ScheduledTask> {
        let st = self.inner.state.lock().await;
        let mut tasks: Vec<_> = st
            .slots
            .values()
            .filter(|s| s.task.status == TaskStatus::Pending)
            .map(|s| s.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// A pending or running task by id. Finished tasks are gone.
    pub async fn get(&self, id: &str) -> Option<ScheduledTask> {
        let st = self.inner.state.lock().await;
        st.slots.get(id).map(|slot| slot.task.clone())
    }

    // ============== Internals ==============

    async fn persist(&self, task: &ScheduledTask) -> Result<()> {
        self.inner
            .store
            .put(TASKS_COLLECTION, &task.id, serde_json::to_value(task)?)
            .await
    }

    async fn retire(&self, id: &str) -> Result<()> {
        self.inner.store.delete(TASKS_COLLECTION, id).await?;
        Ok(())
    }

    /// Smallest id above every id handed out so far, live or retired.
    async fn stored_next_id(&self) -> Result<u64> {
        let max_live = self
            .inner
            .store
            .list(TASKS_COLLECTION)
            .await?
            .iter()
            .filter_map(|(k, _)| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        let mark = self
            .inner
            .store
            .get(META_COLLECTION, NEXT_ID_KEY)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        Ok(mark.max(max_live + 1))
    }

    async fn next_id(&self, st: &mut State) -> Result<u64> {
        let next = match st.next_id {
            Some(n) => n,
            // Scheduling before start().
            None => self.stored_next_id().await?,
        };
        self.inner
            .store
            .put(META_COLLECTION, NEXT_ID_KEY, Value::from(next + 1))
            .await?;
        st.next_id = Some(next + 1);
        Ok(next)
    }

    fn enqueue_locked(&self, st: &mut State, task: ScheduledTask, at: DateTime<Utc>) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        st.queue.push(Reverse(QueueEntry {
            due: at,
            seq,
            id: task.id.clone(),
        }));
        st.slots.insert(task.id.clone(), Slot { task, seq });
    }

    async fn requeue_kind(&self, kind: &str) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<String> = st
            .slots
            .values()
            .filter(|s| s.task.kind == kind && s.task.status == TaskStatus::Pending)
            .map(|s| s.task.id.clone())
            .collect();
        for id in ids {
            if let Some(task) = st.slots.get(&id).map(|s| s.task.clone()) {
                let at = task.due_at;
                self.enqueue_locked(&mut st, task, at);
            }
        }
        drop(st);
        self.inner.wake.notify_one();
    }

    async fn run_loop(&self) {
        loop {
            if self.inner.stop.is_cancelled() {
                break;
            }

            let head = {
                let st = self.inner.state.lock().await;
                st.queue.peek().map(|Reverse(e)| e.due)
            };

            let wait = match head {
                None => None,
                Some(due) => {
                    let now = Utc::now();
                    if due <= now {
                        self.run_due(now).await;
                        continue;
                    }
                    Some((due - now).to_std().unwrap_or(Duration::ZERO))
                }
            };

            match wait {
                None => {
                    tokio::select! {
                        _ = self.inner.stop.cancelled() => break,
                        _ = self.inner.wake.notified() => {}
                    }
                }
                Some(wait) => {
                    tokio::select! {
                        _ = self.inner.stop.cancelled() => break,
                        _ = self.inner.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        tracing::debug!("scheduler loop exited");
    }

    async fn run_due(&self, now: DateTime<Utc>) {
        let mut due = Vec::new();
        {
            let mut st = self.inner.state.lock().await;
            while st.queue.peek().is_some_and(|Reverse(e)| e.due <= now) {
                let Some(Reverse(entry)) = st.queue.pop() else {
                    break;
                };
                let Some(slot) = st.slots.get(&entry.id) else {
                    continue;
                };
                if slot.seq != entry.seq || slot.task.status != TaskStatus::Pending {
                    continue;
                }

                let task = slot.task.clone();
                match self.handler(&task.kind) {
                    Some(handler) => {
                        if let Some(slot) = st.slots.get_mut(&entry.id) {
                            slot.task.status = TaskStatus::Running;
                            let mut running = task;
                            running.status = TaskStatus::Running;
                            due.push((running, handler));
                        }
                    }
                    None => {
                        tracing::warn!(
                            task_id = %task.id,
                            kind = %task.kind,
                            "no handler registered for task kind, deferring"
                        );
                        let retry_at = now
                            + chrono::Duration::from_std(MISSING_HANDLER_RETRY)
                                .unwrap_or(chrono::Duration::seconds(60));
                        self.enqueue_locked(&mut st, task, retry_at);
                    }
                }
            }
        }

        for (task, handler) in due {
            if let Err(e) = self.persist(&task).await {
                tracing::error!(task_id = %task.id, "failed to persist running state: {e}");
            }
            self.execute(task, handler);
        }
    }

    fn execute(&self, task: ScheduledTask, handler: Arc<dyn TaskHandler>) {
        let scheduler = self.clone();
        let ctx = TaskContext {
            responder: self.inner.responder.clone(),
            store: self.inner.store.clone(),
            cancel: self.inner.abort.child_token(),
        };

        self.inner.tracker.spawn(async move {
            tracing::debug!(task_id = %task.id, kind = %task.kind, "running task");

            let run_task = task.clone();
            let run_ctx = ctx.clone();
            let mut join =
                tokio::spawn(async move { handler.run(&run_task, &run_ctx).await });

            let outcome = tokio::select! {
                res = &mut join => match res {
                    Ok(r) => r,
                    Err(e) if e.is_panic() => Err(Error::Handler(anyhow::anyhow!("task handler panicked"))),
                    Err(_) => Err(Error::Cancelled),
                },
                _ = ctx.cancel.cancelled() => {
                    join.abort();
                    Err(Error::Cancelled)
                }
            };

            scheduler.finish(task, outcome).await;
        });
    }

    async fn finish(&self, mut task: ScheduledTask, outcome: Result<()>) {
        let now = Utc::now();
        let mut failure = None;

        let mut st = self.inner.state.lock().await;
        match outcome {
            Ok(()) => match task.repeat_every_secs {
                Some(every) => {
                    task.status = TaskStatus::Pending;
                    task.attempts = 0;
                    task.last_error = None;
                    task.due_at = next_occurrence(task.due_at, every, now);
                }
                None => task.status = TaskStatus::Completed,
            },
            Err(Error::Cancelled) => {
                // At-least-once: an aborted run goes back to pending.
                task.status = TaskStatus::Pending;
            }
            Err(e) => {
                task.attempts += 1;
                task.last_error = Some(error_chain(&e));
                match task.retry.filter(|r| task.attempts < r.max_attempts) {
                    Some(policy) => {
                        let delay = policy.delay(task.attempts);
                        tracing::warn!(
                            task_id = %task.id,
                            attempt = task.attempts,
                            ?delay,
                            "task failed, retrying: {e}"
                        );
                        task.status = TaskStatus::Pending;
                        task.due_at = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or(chrono::Duration::seconds(60));
                    }
                    None => {
                        task.status = TaskStatus::Failed;
                        failure = Some(e);
                    }
                }
            }
        }

        let saved = if task.status.is_terminal() {
            self.retire(&task.id).await
        } else {
            self.persist(&task).await
        };
        if let Err(e) = saved {
            tracing::error!(task_id = %task.id, status = %task.status, "failed to persist task state: {e}");
        }

        if task.status == TaskStatus::Pending {
            let at = task.due_at;
            self.enqueue_locked(&mut st, task.clone(), at);
        } else {
            st.slots.remove(&task.id);
        }
        drop(st);
        self.inner.wake.notify_one();

        if let Some(source) = failure {
            let origin = Origin::Task {
                task_id: task.id.clone(),
                kind: task.kind.clone(),
            };
            let err: Error = SchedulerError::TaskFailed {
                task_id: task.id,
                kind: task.kind,
                source: Box::new(source),
            }
            .into();
            self.inner.funnel.report(&origin, None, &err).await;
        }
    }
}

/// First slot of a fixed-interval series strictly after `now`.
pub fn next_occurrence(due: DateTime<Utc>, every_secs: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let every = every_secs.max(1);
    let behind = u64::try_from((now - due).num_seconds()).unwrap_or(0);
    let steps = behind / every + 1;
    let offset = i64::try_from(steps.saturating_mul(every)).unwrap_or(i64::MAX);
    due.checked_add_signed(chrono::Duration::seconds(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
