// Scheduler core: run loop, step timing and the shared state that the
// command server and signal handler mutate through `SchedulerHandle`.

pub mod store;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use tokio::sync::Notify;

use crate::errors::SchedulerError;
use crate::models::paths::validate_name;
use crate::models::{SchedulerConfig, StatusSnapshot};
use crate::step::StepExecutor;
use store::StatusStore;

/// Granularity of every sleep in the run loop. State changes made by the
/// command server or a signal take effect within one tick.
pub const POLL_TICK: Duration = Duration::from_secs(1);

/// Lifecycle of a scheduler. `Paused` is only reachable from `Active`, so a
/// paused scheduler is always a running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Active,
    Paused,
    Stopped,
}

impl Phase {
    pub fn is_running(self) -> bool {
        matches!(self, Phase::Active | Phase::Paused)
    }
}

/// What happens after repeated step failures.
///
/// Failed steps are retried on the next regular interval. Once
/// `threshold` failures happen in a row, every further wait is `backoff`
/// until a step succeeds again. A threshold of 0 disables the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub threshold: u32,
    pub backoff: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            backoff: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&SchedulerConfig> for FailurePolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            threshold: config.failure_threshold,
            backoff: Duration::from_secs(config.failure_backoff_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SchedulerState {
    phase: Phase,
    daemon_mode: bool,
    interval_seconds: u64,
    step_count: u64,
    failed_step_count: u64,
    consecutive_failures: u32,
    /// Start and length of the current failure backoff.
    backoff: Option<(Instant, Duration)>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    last_run_time: Option<DateTime<Utc>>,
    last_attempt_time: Option<DateTime<Utc>>,
    next_run_time: Option<DateTime<Utc>>,
    pid: u32,
}

impl SchedulerState {
    fn new(interval_seconds: u64) -> Self {
        Self {
            phase: Phase::NotStarted,
            daemon_mode: false,
            interval_seconds,
            step_count: 0,
            failed_step_count: 0,
            consecutive_failures: 0,
            backoff: None,
            start_time: None,
            stop_time: None,
            last_run_time: None,
            last_attempt_time: None,
            next_run_time: None,
            pid: std::process::id(),
        }
    }

    fn snapshot(&self, name: &str, executor: &str) -> StatusSnapshot {
        let uptime_seconds = match self.start_time {
            Some(start) => {
                let end = self.stop_time.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as f64 / 1000.0
            }
            None => 0.0,
        };
        StatusSnapshot {
            name: name.to_string(),
            running: self.phase.is_running(),
            paused: self.phase == Phase::Paused,
            daemon_mode: self.daemon_mode,
            step_count: self.step_count,
            interval_seconds: self.interval_seconds,
            start_time: self.start_time,
            last_run_time: self.last_run_time,
            next_run_time: self.next_run_time,
            uptime_seconds,
            pid: self.pid,
            executor: executor.to_string(),
            last_attempt_time: self.last_attempt_time,
            consecutive_failures: self.consecutive_failures,
            failed_step_count: self.failed_step_count,
        }
    }
}

struct Shared {
    name: String,
    executor_description: String,
    state: Mutex<SchedulerState>,
    wake: Notify,
    store: StatusStore,
}

/// `t + secs`, or `None` if that is not representable.
fn later(t: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    t.checked_add_signed(TimeDelta::try_seconds(secs)?)
}

// ---------------------------------------------------------------------------
// SchedulerHandle
// ---------------------------------------------------------------------------

/// Cloneable control surface over a scheduler's state.
///
/// The lock is only ever held for field updates, never across a step or an
/// `.await`, so `status()` does not wait on the run loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    pub fn has_stopped(&self) -> bool {
        self.phase() == Phase::Stopped
    }

    pub fn interval_seconds(&self) -> u64 {
        self.lock().interval_seconds
    }

    pub fn status(&self) -> StatusSnapshot {
        self.lock()
            .snapshot(&self.shared.name, &self.shared.executor_description)
    }

    /// Request the run loop to exit. Idempotent; safe from any context.
    ///
    /// An in-flight step is not interrupted; the loop exits once it returns.
    /// Returns whether the scheduler was running.
    pub fn stop(&self) -> bool {
        let was_running = {
            let mut state = self.lock();
            let was_running = state.phase.is_running();
            state.phase = Phase::Stopped;
            state.next_run_time = None;
            was_running
        };
        if was_running {
            tracing::info!("Scheduler '{}' stopped", self.shared.name);
        }
        self.shared.wake.notify_one();
        was_running
    }

    /// `stop()`, then write the stopped state to the status file right away
    /// instead of after the in-flight step returns.
    pub async fn shutdown(&self) -> bool {
        let was_running = self.stop();
        self.persist().await;
        was_running
    }

    /// Pause stepping. No-op unless the scheduler is active.
    pub async fn pause(&self) -> bool {
        let changed = {
            let mut state = self.lock();
            if state.phase == Phase::Active {
                state.phase = Phase::Paused;
                true
            } else {
                false
            }
        };
        if changed {
            tracing::info!("Scheduler '{}' paused", self.shared.name);
            self.shared.wake.notify_one();
            self.persist().await;
        }
        changed
    }

    /// Resume stepping. No-op unless the scheduler is paused.
    pub async fn resume(&self) -> bool {
        let changed = {
            let mut state = self.lock();
            if state.phase == Phase::Paused {
                state.phase = Phase::Active;
                true
            } else {
                false
            }
        };
        if changed {
            tracing::info!("Scheduler '{}' resumed", self.shared.name);
            self.shared.wake.notify_one();
            self.persist().await;
        }
        changed
    }

    /// Change the interval. A sleeping run loop picks it up on its next tick.
    pub async fn set_interval(&self, seconds: u64) -> Result<(), SchedulerError> {
        if seconds == 0 {
            return Err(SchedulerError::Validation(
                "Interval must be at least 1 second".to_string(),
            ));
        }
        {
            let mut state = self.lock();
            state.interval_seconds = seconds;
            if state.next_run_time.is_some() && state.backoff.is_none() {
                state.next_run_time = state.last_attempt_time.and_then(|t| later(t, seconds));
            }
        }
        tracing::info!(
            "Scheduler '{}' interval changed to {} seconds",
            self.shared.name,
            seconds
        );
        self.shared.wake.notify_one();
        self.persist().await;
        Ok(())
    }

    /// Write the current snapshot to the status file. Failures are logged.
    pub async fn persist(&self) {
        let snapshot = self.status();
        if let Err(e) = self.shared.store.write(&snapshot).await {
            tracing::error!("Failed to update status file: {}", e);
        }
    }

    /// Sleep for up to `duration`, returning early on any state change.
    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shared.wake.notified() => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Invokes one `StepExecutor` on a fixed interval until stopped.
pub struct Scheduler {
    handle: SchedulerHandle,
    executor: Arc<dyn StepExecutor>,
    policy: FailurePolicy,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        interval_seconds: u64,
        executor: Arc<dyn StepExecutor>,
        status_file: PathBuf,
    ) -> Result<Self, SchedulerError> {
        let name = name.into();
        validate_name(&name)?;
        if interval_seconds == 0 {
            return Err(SchedulerError::Validation(
                "Interval must be at least 1 second".to_string(),
            ));
        }

        let shared = Shared {
            name,
            executor_description: executor.describe(),
            state: Mutex::new(SchedulerState::new(interval_seconds)),
            wake: Notify::new(),
            store: StatusStore::new(status_file),
        };

        tracing::info!(
            "Scheduler '{}' initialized with {}s interval",
            shared.name,
            interval_seconds
        );

        Ok(Self {
            handle: SchedulerHandle {
                shared: Arc::new(shared),
            },
            executor,
            policy: FailurePolicy::default(),
        })
    }

    pub fn with_daemon_mode(self, daemon_mode: bool) -> Self {
        self.handle.lock().daemon_mode = daemon_mode;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Run the loop until `stop()` is called or a step panics.
    ///
    /// The status file is written on entry, after every step and on exit,
    /// whichever way the loop ends.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.handle.lock();
            match state.phase {
                Phase::NotStarted => {}
                Phase::Stopped => {
                    tracing::info!(
                        "Scheduler '{}' was stopped before it started",
                        self.handle.name()
                    );
                    return Ok(());
                }
                Phase::Active | Phase::Paused => {
                    return Err(SchedulerError::Validation(format!(
                        "Scheduler '{}' is already running",
                        self.handle.name()
                    )));
                }
            }
            state.phase = Phase::Active;
            state.start_time = Some(Utc::now());
        }
        self.handle.persist().await;
        tracing::info!("Scheduler '{}' main loop started", self.handle.name());

        let result = self.drive().await;

        {
            let mut state = self.handle.lock();
            state.phase = Phase::Stopped;
            state.stop_time = Some(Utc::now());
            state.next_run_time = None;
        }
        self.handle.persist().await;

        match &result {
            Ok(()) => tracing::info!("Scheduler '{}' main loop exited", self.handle.name()),
            Err(e) => tracing::error!("Scheduler '{}' error: {}", self.handle.name(), e),
        }
        result
    }

    async fn drive(&self) -> Result<(), SchedulerError> {
        loop {
            match self.handle.phase() {
                Phase::NotStarted | Phase::Stopped => return Ok(()),
                Phase::Paused => {
                    self.handle.idle(POLL_TICK).await;
                    continue;
                }
                Phase::Active => {}
            }

            // A backoff outlives pause and resume.
            if let Some(remaining) = self.backoff_remaining() {
                self.handle.idle(remaining.min(POLL_TICK)).await;
                continue;
            }

            self.execute_step().await?;

            self.schedule_next();
            self.handle.persist().await;
            self.wait_for_next_step(Instant::now()).await;
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let (started, length) = self.handle.lock().backoff?;
        Some(length.saturating_sub(started.elapsed())).filter(|remaining| !remaining.is_zero())
    }

    async fn execute_step(&self) -> Result<(), SchedulerError> {
        let (attempt, use_init) = {
            let state = self.handle.lock();
            (
                state.step_count + 1,
                state.step_count == 0 && self.executor.has_init(),
            )
        };

        tracing::info!("Executing step #{}", attempt);
        let started = Instant::now();
        let call = if use_init {
            tracing::debug!("Executing init run");
            self.executor.init_run()
        } else {
            self.executor.run()
        };
        let result = AssertUnwindSafe(call).catch_unwind().await;
        let elapsed = started.elapsed().as_secs_f64();
        let finished = Utc::now();

        let mut state = self.handle.lock();
        state.last_attempt_time = Some(finished);
        match result {
            Ok(Ok(true)) => {
                state.step_count += 1;
                state.consecutive_failures = 0;
                state.last_run_time = Some(finished);
                tracing::info!(
                    "Step #{} completed successfully in {:.2}s",
                    state.step_count,
                    elapsed
                );
            }
            Ok(Ok(false)) => {
                state.failed_step_count += 1;
                state.consecutive_failures += 1;
                tracing::error!("Step #{} failed after {:.2}s", attempt, elapsed);
            }
            Ok(Err(e)) => {
                state.failed_step_count += 1;
                state.consecutive_failures += 1;
                tracing::error!("Step #{} failed after {:.2}s: {:#}", attempt, elapsed, e);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Step #{} panicked: {}", attempt, message);
                return Err(SchedulerError::StepPanicked(message));
            }
        }
        Ok(())
    }

    fn schedule_next(&self) {
        let mut state = self.handle.lock();
        let now = Utc::now();
        let backoff = self.policy.threshold > 0
            && state.consecutive_failures >= self.policy.threshold;

        if backoff {
            tracing::warn!(
                "{} consecutive step failures; waiting {}s before the next attempt",
                state.consecutive_failures,
                self.policy.backoff.as_secs()
            );
            state.next_run_time = later(now, self.policy.backoff.as_secs());
            state.backoff = Some((Instant::now(), self.policy.backoff));
        } else {
            state.next_run_time = later(now, state.interval_seconds);
            state.backoff = None;
        }
    }

    /// Sleep in ticks of at most `POLL_TICK` until the interval has elapsed or
    /// the scheduler leaves the active phase. The interval is re-read every
    /// tick. Backoff waits are left to `drive`.
    async fn wait_for_next_step(&self, started: Instant) {
        loop {
            let (phase, interval, in_backoff) = {
                let state = self.handle.lock();
                (
                    state.phase,
                    state.interval_seconds,
                    state.backoff.is_some(),
                )
            };
            if phase != Phase::Active || in_backoff {
                return;
            }
            let target = Duration::from_secs(interval);
            let elapsed = started.elapsed();
            if elapsed >= target {
                return;
            }
            self.handle.idle((target - elapsed).min(POLL_TICK)).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
