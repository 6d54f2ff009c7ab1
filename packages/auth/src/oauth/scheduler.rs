// ABOUTME: Delay-queue refresh scheduler with a bounded worker pool
// ABOUTME: One pending job per token, exponential backoff on transient failures, intervention flags

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_config::LifecycleConfig;
use warden_core::{jitter_millis, TokenKey};

use crate::oauth::events::{EventBus, LifecycleEvent, RefreshFailureReason, RefreshTrigger};
use crate::oauth::types::TokenSnapshot;

/// Upper bound on the backoff exponent so delays stay finite
const MAX_BACKOFF_SHIFT: u32 = 16;

/// A pending or running refresh for one token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshJob {
    pub id: Uuid,
    pub key: TokenKey,
    pub scheduled_at: DateTime<Utc>,
    /// 1-based; retries increment it
    pub attempt: u32,
    pub proactive: bool,
    pub observed_refresh_count: u32,
    pub observed_expires_at: DateTime<Utc>,
    due: Instant,
}

impl RefreshJob {
    pub fn trigger(&self) -> RefreshTrigger {
        if self.proactive {
            RefreshTrigger::Proactive
        } else {
            RefreshTrigger::Backstop
        }
    }

    /// Whether the token changed since this job was scheduled
    pub fn is_stale_for(&self, current: &TokenSnapshot) -> bool {
        current.refresh_count != self.observed_refresh_count
            || current.expires_at.timestamp_millis() != self.observed_expires_at.timestamp_millis()
    }

    fn retry_after(&self, delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: self.key.clone(),
            scheduled_at: Utc::now() + to_chrono(delay),
            attempt: self.attempt + 1,
            proactive: self.proactive,
            observed_refresh_count: self.observed_refresh_count,
            observed_expires_at: self.observed_expires_at,
            due: Instant::now() + delay,
        }
    }
}

/// Scheduler view of a token key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Scheduled,
    Retrying,
    Running,
    /// Retries ran out; nothing is armed until the token is stored again
    Exhausted,
}

/// What a handler reports back for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The job no longer applied: token gone or changed since scheduling
    Skipped,
    /// Worth retrying with backoff
    Transient(String),
    /// Handled for good by the handler (token removed or flagged)
    Terminal,
}

/// Performs the refresh a job asks for
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &RefreshJob) -> JobOutcome;
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<(Instant, u64, TokenKey, Uuid)>>,
    pending: HashMap<TokenKey, RefreshJob>,
    running: HashMap<TokenKey, usize>,
    exhausted: HashSet<TokenKey>,
    seq: u64,
}

impl QueueState {
    fn enqueue(&mut self, job: RefreshJob) {
        self.seq += 1;
        self.heap
            .push(Reverse((job.due, self.seq, job.key.clone(), job.id)));
        self.pending.insert(job.key.clone(), job);
    }

    /// Earliest due time among live entries; cancelled entries are dropped lazily
    fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((due, _, key, id))) = self.heap.peek() {
            if self.pending.get(key).map(|job| job.id) == Some(*id) {
                return Some(*due);
            }
            self.heap.pop();
        }
        None
    }

    fn take_due(&mut self, now: Instant) -> Vec<RefreshJob> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, _, key, id))) = self.heap.pop() else {
                break;
            };
            if self.pending.get(&key).map(|job| job.id) != Some(id) {
                continue;
            }
            if let Some(job) = self.pending.remove(&key) {
                *self.running.entry(key).or_insert(0) += 1;
                due.push(job);
            }
        }
        due
    }

    fn finish(&mut self, key: &TokenKey) {
        if let Some(count) = self.running.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.running.remove(key);
            }
        }
    }
}

/// Delay = time until the refresh threshold is crossed, pulled earlier by
/// `backstop_margin_ms` for backstop jobs, then jittered; never negative
pub fn compute_refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    proactive: bool,
    refresh_threshold_ms: u64,
    backstop_margin_ms: u64,
    jitter_ms: i64,
) -> Duration {
    let threshold = i64::try_from(refresh_threshold_ms).unwrap_or(i64::MAX);
    let mut millis = (expires_at - now)
        .num_milliseconds()
        .saturating_sub(threshold);
    if !proactive {
        millis = millis.saturating_sub(i64::try_from(backstop_margin_ms).unwrap_or(i64::MAX));
    }
    let millis = millis.max(0).saturating_add(jitter_ms).max(0);
    Duration::from_millis(millis as u64)
}

/// Schedules refresh jobs and runs them on a bounded pool of workers
pub struct RefreshScheduler {
    config: LifecycleConfig,
    events: EventBus,
    state: Mutex<QueueState>,
    wakeup: Notify,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl RefreshScheduler {
    pub fn new(config: LifecycleConfig, events: EventBus, shutdown: CancellationToken) -> Self {
        let workers = Arc::new(Semaphore::new(config.refresh_workers.max(1)));
        Self {
            config,
            events,
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            workers,
            shutdown,
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay before the next refresh of `token`, jitter included
    pub fn refresh_delay(&self, token: &TokenSnapshot, now: DateTime<Utc>, proactive: bool) -> Duration {
        compute_refresh_delay(
            token.expires_at,
            now,
            proactive,
            self.config.refresh_threshold_ms,
            self.config.backstop_margin_ms,
            jitter_millis(self.config.refresh_jitter_ms),
        )
    }

    /// Arm a refresh job; no-op while one is pending for the key
    pub fn schedule(&self, token: &TokenSnapshot, proactive: bool) -> bool {
        self.arm(token, proactive, false, Duration::ZERO)
    }

    /// Replace whatever job is pending for the key with a fresh one
    pub fn reschedule(&self, token: &TokenSnapshot, proactive: bool) -> bool {
        self.arm(token, proactive, true, Duration::ZERO)
    }

    /// Re-arm after a successful refresh
    ///
    /// The next refresh waits at least half of the new lifetime and never less
    /// than `min_refresh_interval_ms`.
    pub fn reschedule_after_refresh(
        &self,
        token: &TokenSnapshot,
        proactive: bool,
        lifetime: chrono::Duration,
    ) -> bool {
        let half_life = lifetime.to_std().map(|l| l / 2).unwrap_or(Duration::ZERO);
        let floor = half_life.max(self.config.min_refresh_interval());
        let threshold = i64::try_from(self.config.refresh_threshold_ms).unwrap_or(i64::MAX);
        if lifetime.num_milliseconds() <= threshold {
            warn!(
                "Token for {} lives {}ms, within the {}ms refresh threshold; next refresh in {}ms",
                token.key,
                lifetime.num_milliseconds(),
                threshold,
                floor.as_millis()
            );
        }
        self.arm(token, proactive, true, floor)
    }

    fn arm(&self, token: &TokenSnapshot, proactive: bool, replace: bool, floor: Duration) -> bool {
        if !token.refreshable {
            debug!("Not scheduling {}: no refresh token", token.key);
            return false;
        }
        if self.shutdown.is_cancelled() {
            return false;
        }

        let now = Utc::now();
        let delay = self.refresh_delay(token, now, proactive).max(floor);
        let job = RefreshJob {
            id: Uuid::new_v4(),
            key: token.key.clone(),
            scheduled_at: now + to_chrono(delay),
            attempt: 1,
            proactive,
            observed_refresh_count: token.refresh_count,
            observed_expires_at: token.expires_at,
            due: Instant::now() + delay,
        };

        {
            let mut state = self.state();
            if state.exhausted.contains(&token.key) {
                debug!("Not scheduling {}: awaiting manual intervention", token.key);
                return false;
            }
            if state.pending.contains_key(&token.key) {
                if !replace {
                    return false;
                }
                state.pending.remove(&token.key);
            }
            state.enqueue(job);
        }
        self.wakeup.notify_one();

        debug!(
            "Scheduled {} refresh for {} in {}ms",
            if proactive { "proactive" } else { "backstop" },
            token.key,
            delay.as_millis()
        );
        true
    }

    /// Arm jobs for every refreshable token, returning how many were armed
    pub fn rehydrate<I>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = TokenSnapshot>,
    {
        let proactive = self.config.proactive_refresh_enabled;
        let armed = tokens
            .into_iter()
            .filter(|token| self.schedule(token, proactive))
            .count();
        info!("Rehydrated {} refresh job(s)", armed);
        armed
    }

    /// Drop the pending job for a key; a running job is left to finish
    pub fn cancel(&self, key: &TokenKey) -> bool {
        let cancelled = self.state().pending.remove(key).is_some();
        if cancelled {
            debug!("Cancelled pending refresh for {}", key);
        }
        cancelled
    }

    pub fn pending_job(&self, key: &TokenKey) -> Option<RefreshJob> {
        self.state().pending.get(key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn job_state(&self, key: &TokenKey) -> JobState {
        let state = self.state();
        if state.running.contains_key(key) {
            JobState::Running
        } else if let Some(job) = state.pending.get(key) {
            if job.attempt > 1 {
                JobState::Retrying
            } else {
                JobState::Scheduled
            }
        } else if state.exhausted.contains(key) {
            JobState::Exhausted
        } else {
            JobState::Idle
        }
    }

    /// Whether automatic retries gave up on this key
    pub fn needs_intervention(&self, key: &TokenKey) -> bool {
        self.state().exhausted.contains(key)
    }

    pub fn clear_intervention(&self, key: &TokenKey) -> bool {
        self.state().exhausted.remove(key)
    }

    /// Stop automatic refreshes for a key until it is cleared
    pub fn mark_intervention(&self, key: &TokenKey) {
        let mut state = self.state();
        state.pending.remove(key);
        state.exhausted.insert(key.clone());
    }

    /// Start the dispatcher; jobs are handed to `handler` while it is alive
    pub fn start(self: &Arc<Self>, handler: Weak<dyn JobHandler>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Refresh dispatcher already running");
            return;
        }
        let scheduler = Arc::clone(self);
        self.tracker.spawn(async move { scheduler.dispatch(handler).await });
    }

    /// Stop dispatching and wait for running workers to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Refresh scheduler stopped");
    }

    async fn dispatch(self: Arc<Self>, handler: Weak<dyn JobHandler>) {
        info!(
            "Refresh dispatcher started ({} workers)",
            self.config.refresh_workers
        );

        'dispatch: loop {
            let next_due = self.state().next_due();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => continue,
                _ = sleep_until(next_due) => {}
            }

            let mut due = self.state().take_due(Instant::now()).into_iter();
            while let Some(job) = due.next() {
                let permit = tokio::select! {
                    permit = Arc::clone(&self.workers).acquire_owned() => permit,
                    _ = self.shutdown.cancelled() => {
                        let mut state = self.state();
                        state.finish(&job.key);
                        due.for_each(|job| state.finish(&job.key));
                        break 'dispatch;
                    }
                };
                let Ok(permit) = permit else {
                    error!("Refresh worker pool closed");
                    break 'dispatch;
                };
                let Some(handler) = handler.upgrade() else {
                    warn!("Refresh handler dropped; stopping dispatcher");
                    break 'dispatch;
                };

                let scheduler = Arc::clone(&self);
                self.tracker.spawn(async move {
                    let _permit = permit;
                    scheduler.run_job(handler.as_ref(), job).await;
                });
            }
        }

        info!("Refresh dispatcher stopped");
    }

    async fn run_job(&self, handler: &dyn JobHandler, job: RefreshJob) {
        debug!(
            "Running refresh job {} for {} (attempt {})",
            job.id, job.key, job.attempt
        );
        let outcome = match AssertUnwindSafe(handler.process(&job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Refresh job {} for {} panicked", job.id, job.key);
                JobOutcome::Transient("refresh worker panicked".to_string())
            }
        };

        let mut state = self.state();
        state.finish(&job.key);

        match outcome {
            JobOutcome::Completed => {
                state.exhausted.remove(&job.key);
            }
            JobOutcome::Skipped | JobOutcome::Terminal => {}
            JobOutcome::Transient(message) if job.attempt < self.config.max_refresh_attempts => {
                if state.pending.contains_key(&job.key) {
                    debug!("Newer job pending for {}; not retrying", job.key);
                    return;
                }
                let delay = self.backoff(job.attempt);
                warn!(
                    "Refresh attempt {} for {} failed ({}); retrying in {}ms",
                    job.attempt,
                    job.key,
                    message,
                    delay.as_millis()
                );
                state.enqueue(job.retry_after(delay));
                drop(state);
                self.wakeup.notify_one();
            }
            JobOutcome::Transient(message) => {
                state.exhausted.insert(job.key.clone());
                drop(state);
                error!(
                    "Refresh for {} failed after {} attempts; manual intervention needed",
                    job.key, job.attempt
                );
                self.events.emit(LifecycleEvent::RefreshFailed {
                    key: job.key,
                    reason: RefreshFailureReason::RetriesExhausted,
                    terminal: false,
                    message,
                });
            }
        }
    }

    /// `refresh_retry_delay_ms × 2^(attempt−1)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        Duration::from_millis(self.config.refresh_retry_delay_ms.saturating_mul(1u64 << shift))
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
