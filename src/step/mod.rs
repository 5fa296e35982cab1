// Step executors: the unit of work the scheduler invokes once per interval.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

/// A unit of work invoked by the scheduler.
///
/// `Ok(true)` is a successful step, `Ok(false)` and `Err(_)` are failed steps.
/// Implementations are never called concurrently with themselves by the
/// scheduler. A panic is treated as fatal by the run loop.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self) -> anyhow::Result<bool>;

    /// Whether `init_run` should be used instead of `run` until the first
    /// successful step.
    fn has_init(&self) -> bool {
        false
    }

    async fn init_run(&self) -> anyhow::Result<bool> {
        self.run().await
    }

    /// Human-readable description, shown in the status snapshot.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// CommandStep - shell command executor
// ---------------------------------------------------------------------------

/// Runs a shell command through `sh -c`. Success means exit status 0.
#[derive(Debug, Clone)]
pub struct CommandStep {
    cmd: String,
    init_cmd: Option<String>,
    timeout: Option<Duration>,
}

impl CommandStep {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            init_cmd: None,
            timeout: None,
        }
    }

    /// Command to run instead of the regular one until the first success.
    pub fn with_init(mut self, init_cmd: impl Into<String>) -> Self {
        self.init_cmd = Some(init_cmd.into());
        self
    }

    /// Kill the command and fail the step if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn execute(&self, cmd: &str) -> anyhow::Result<bool> {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| anyhow::anyhow!("Step command timed out after {:?}", limit))?,
            None => command.output().await,
        }
        .with_context(|| format!("Failed to run step command '{}'", cmd))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::debug!(target: "ithaca_scheduler::step::stdout", "{}", line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::debug!(target: "ithaca_scheduler::step::stderr", "{}", line);
        }

        if output.status.success() {
            Ok(true)
        } else {
            tracing::warn!("Step command '{}' exited with {}", cmd, output.status);
            Ok(false)
        }
    }
}

#[async_trait]
impl StepExecutor for CommandStep {
    async fn run(&self) -> anyhow::Result<bool> {
        self.execute(&self.cmd).await
    }

    fn has_init(&self) -> bool {
        self.init_cmd.is_some()
    }

    async fn init_run(&self) -> anyhow::Result<bool> {
        match &self.init_cmd {
            Some(init) => self.execute(init).await,
            None => self.run().await,
        }
    }

    fn describe(&self) -> String {
        match &self.init_cmd {
            Some(init) => format!("sh -c {:?} (init: sh -c {:?})", self.cmd, init),
            None => format!("sh -c {:?}", self.cmd),
        }
    }
}

// ---------------------------------------------------------------------------
// MockStep - scripted executor for tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    Fail,
    Error(String),
    Panic(String),
}

/// Executor that plays back a script of outcomes, then repeats `fallback`.
pub struct MockStep {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    with_init: bool,
    delay: Duration,
    run_calls: AtomicUsize,
    init_calls: AtomicUsize,
}

impl MockStep {
    pub fn scripted(outcomes: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback,
            with_init: false,
            delay: Duration::ZERO,
            run_calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::scripted(Vec::new(), MockOutcome::Succeed)
    }

    pub fn failing() -> Self {
        Self::scripted(Vec::new(), MockOutcome::Fail)
    }

    /// Expose an initialization variant (counted separately).
    pub fn with_init(mut self) -> Self {
        self.with_init = true;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.run_calls() + self.init_calls()
    }

    async fn play(&self) -> anyhow::Result<bool> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match next {
            MockOutcome::Succeed => Ok(true),
            MockOutcome::Fail => Ok(false),
            MockOutcome::Error(msg) => Err(anyhow::anyhow!(msg)),
            MockOutcome::Panic(msg) => panic!("{}", msg),
        }
    }
}

#[async_trait]
impl StepExecutor for MockStep {
    async fn run(&self) -> anyhow::Result<bool> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.play().await
    }

    fn has_init(&self) -> bool {
        self.with_init
    }

    async fn init_run(&self) -> anyhow::Result<bool> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.play().await
    }

    fn describe(&self) -> String {
        "Mock step for tests".to_string()
    }
}
