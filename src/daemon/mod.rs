// Daemon module: single-instance bookkeeping, config/runtime resolution,
// logging setup and the orchestration that ties scheduler, command server
// and signal handler together for one named instance.

pub mod fork;
pub mod signals;

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;

use crate::control::server::{CommandServer, ACCEPT_POLL};
use crate::errors::SchedulerError;
use crate::models::{InstancePaths, SchedulerConfig};
use crate::scheduler::{FailurePolicy, Scheduler};
use crate::step::StepExecutor;

// ---------------------------------------------------------------------------
// PidFile - exclusive PID file acquisition
// ---------------------------------------------------------------------------

/// What a PID file currently says about its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    Absent,
    Alive(u32),
    /// The file exists but names a dead process, or cannot be parsed.
    Stale,
}

/// Manages a PID file to ensure only one instance per name runs at a time.
///
/// Uses exclusive file creation (O_EXCL) to prevent races.
/// If the PID file exists, checks whether the recorded PID is still alive.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create a new PidFile handle (does not acquire yet).
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Inspect the file without modifying it.
    pub fn state(&self) -> PidState {
        if !self.path.exists() {
            return PidState::Absent;
        }
        match self.read_pid() {
            Some(pid) if is_process_alive(pid) => PidState::Alive(pid),
            _ => PidState::Stale,
        }
    }

    /// Acquire the PID file for instance `name`.
    ///
    /// - If the file does not exist, creates it exclusively and writes the
    ///   current PID.
    /// - If the file exists and the recorded PID is alive, returns
    ///   `AlreadyRunning`.
    /// - If the file exists but is stale, removes it and acquires.
    pub fn acquire(&self, name: &str) -> Result<(), SchedulerError> {
        match self.state() {
            PidState::Alive(pid) => {
                return Err(SchedulerError::AlreadyRunning {
                    name: name.to_string(),
                    pid,
                })
            }
            PidState::Stale => {
                tracing::warn!("Removing stale PID file {}", self.path.display());
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(SchedulerError::Storage(format!(
                            "Failed to remove stale PID file {}: {}",
                            self.path.display(),
                            e
                        )))
                    }
                }
            }
            PidState::Absent => {}
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    // Lost a race with another starter.
                    SchedulerError::AlreadyRunning {
                        name: name.to_string(),
                        pid: self.read_pid().unwrap_or(0),
                    }
                } else {
                    SchedulerError::Storage(format!(
                        "Failed to create PID file {}: {}",
                        self.path.display(),
                        e
                    ))
                }
            })?;

        let pid = std::process::id();
        write!(file, "{}", pid)?;
        file.flush()?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    /// Release the PID file by removing it. Idempotent.
    pub fn release(&self) -> Result<(), SchedulerError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("PID file released: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SchedulerError::Storage(format!(
                "Failed to remove PID file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Check if the PID file exists and the recorded process is alive.
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), PidState::Alive(_))
    }
}

/// Check whether a process with the given PID is alive.
///
/// Uses kill(pid, 0); EPERM means the process exists but belongs to someone
/// else, which still counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // signal 0 tests process existence
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path) -> Result<SchedulerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SchedulerConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Locate the config file, first hit wins:
///   1. --config CLI flag (passed as config_path; a missing file is an error)
///   2. ITHACA_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/ithaca/config.json)
///
/// `None` means defaults apply. Does not log, so it can run before the
/// subscriber is installed.
pub fn config_source(config_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Some(config_dir) = std::env::var_os("ITHACA_CONFIG_DIR") {
        let path = PathBuf::from(config_dir).join("config.json");
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("ithaca").join("config.json");
        if path.exists() {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

/// Load the SchedulerConfig from `config_source`, or defaults if there is none.
pub fn load_config(config_path: Option<&Path>) -> Result<SchedulerConfig> {
    match config_source(config_path)? {
        Some(path) => read_config(&path),
        None => Ok(SchedulerConfig::default()),
    }
}

fn log_config_source(source: Option<&Path>) {
    match source {
        Some(path) => tracing::info!("Loaded config from: {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }
}

/// Resolve the runtime directory: `override_dir` (the --runtime-dir flag),
/// then ITHACA_RUNTIME_DIR, then the config value, then the OS temp dir.
///
/// The result is absolute, since a daemon changes its working directory.
pub fn resolve_runtime_dir(config: &SchedulerConfig, override_dir: Option<&Path>) -> PathBuf {
    let dir = if let Some(dir) = override_dir {
        dir.to_path_buf()
    } else if let Some(dir) = std::env::var_os("ITHACA_RUNTIME_DIR").filter(|d| !d.is_empty()) {
        PathBuf::from(dir)
    } else {
        config.runtime_dir()
    };
    std::path::absolute(&dir).unwrap_or(dir)
}

/// Paths for instance `name` under the resolved runtime directory.
pub fn instance_paths(
    config: &SchedulerConfig,
    name: &str,
    runtime_override: Option<&Path>,
) -> Result<InstancePaths, SchedulerError> {
    let mut effective = config.clone();
    effective.runtime_dir = Some(resolve_runtime_dir(config, runtime_override));
    let runtime_dir = effective.runtime_dir();
    let log_dir = effective.log_dir();
    let log_dir = std::path::absolute(&log_dir).unwrap_or(log_dir);
    InstancePaths::new(&runtime_dir, &log_dir, &config.file_prefix, name)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global tracing subscriber.
///
/// With `log_file` set (daemon mode) events go to that file through a
/// non-blocking writer; the returned guard must be held until exit or
/// buffered lines are lost. Falls back to stderr if the file can't be opened.
pub fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };

    let opened = log_file.map(|path| {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path);
        (path, file)
    });

    match opened {
        Some((path, Ok(file))) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .try_init();
            if result.is_ok() {
                tracing::info!("Logging to {}", path.display());
            }
            Some(guard)
        }
        Some((path, Err(e))) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
            tracing::warn!(
                "Could not open log file {}: {}. Logging to stderr only.",
                path.display(),
                e
            );
            None
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Instance orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct InstanceOptions {
    /// Install the process-wide signal handler. Off for in-process tests.
    pub handle_signals: bool,
    /// Per-connection I/O bound for the command server.
    pub io_timeout: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            handle_signals: true,
            io_timeout: Duration::from_millis(5000),
        }
    }
}

/// Owns the PID file and socket of a claimed instance and removes both on
/// drop, on every exit path after the claim.
struct InstanceFiles {
    pid_file: PidFile,
    socket: PathBuf,
}

impl InstanceFiles {
    fn claim(paths: &InstancePaths) -> Result<Self, SchedulerError> {
        let pid_file = PidFile::new(paths.pid_file.clone());
        pid_file.acquire(&paths.name)?;
        Ok(Self {
            pid_file,
            socket: paths.socket.clone(),
        })
    }
}

impl Drop for InstanceFiles {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.socket) {
            Ok(()) => tracing::debug!("Removed command socket {}", self.socket.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                "Failed to remove command socket {}: {}",
                self.socket.display(),
                e
            ),
        }
        if let Err(e) = self.pid_file.release() {
            tracing::error!("Failed to release PID file: {}", e);
        }
    }
}

/// Run one named instance to completion inside the current tokio runtime.
///
/// Claims the PID file, binds the command socket, runs the scheduler and
/// removes both files again however the run ends. Returns the scheduler's
/// result, or the startup error that prevented it from running.
pub async fn run_instance(
    scheduler: Scheduler,
    paths: &InstancePaths,
    options: InstanceOptions,
) -> Result<(), SchedulerError> {
    // Handlers go in first so an early SIGTERM still goes through cleanup.
    let signal_task = if options.handle_signals {
        Some(signals::spawn(scheduler.handle())?)
    } else {
        None
    };

    let result = serve_instance(&scheduler, paths, options.io_timeout).await;

    if let Some(task) = signal_task {
        task.abort();
    }
    result
}

async fn serve_instance(
    scheduler: &Scheduler,
    paths: &InstancePaths,
    io_timeout: Duration,
) -> Result<(), SchedulerError> {
    let handle = scheduler.handle();

    let files = InstanceFiles::claim(paths).inspect_err(|e| {
        tracing::error!("Failed to start scheduler '{}': {}", paths.name, e);
    })?;
    let server = CommandServer::bind(&paths.socket, handle.clone(), io_timeout).inspect_err(
        |e| {
            tracing::error!("Failed to start scheduler '{}': {}", paths.name, e);
        },
    )?;
    let mut server_task = tokio::spawn(server.serve());

    let result = scheduler.run().await;

    handle.stop();
    if tokio::time::timeout(ACCEPT_POLL * 2, &mut server_task)
        .await
        .is_err()
    {
        tracing::warn!("Command server did not exit in time; aborting it");
        server_task.abort();
    }

    drop(files);
    tracing::info!("Scheduler '{}' shut down", paths.name);
    result
}

// ---------------------------------------------------------------------------
// Starter entry point
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub name: String,
    /// Falls back to `default_interval_secs` from the config.
    pub interval_secs: Option<u64>,
    pub foreground: bool,
    pub config_path: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    pub verbose: bool,
}

/// Start a scheduler instance running `executor`.
///
/// In daemon mode the calling process becomes the launcher: it returns once
/// the detached instance is confirmed to be up. Otherwise this blocks until
/// the instance stops. Must not be called from inside a tokio runtime since
/// daemonizing forks the process.
pub fn start(options: StartOptions, executor: Arc<dyn StepExecutor>) -> Result<()> {
    let source = config_source(options.config_path.as_deref())?;
    let config = match &source {
        Some(path) => read_config(path)?,
        None => SchedulerConfig::default(),
    };
    let paths = instance_paths(&config, &options.name, options.runtime_dir.as_deref())?;

    let interval = options.interval_secs.unwrap_or(config.default_interval_secs);
    if interval == 0 {
        return Err(SchedulerError::Validation(
            "Interval must be at least 1 second".to_string(),
        )
        .into());
    }

    for dir in [paths.pid_file.parent(), paths.log_file.parent()]
        .into_iter()
        .flatten()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    if let PidState::Alive(pid) = PidFile::new(paths.pid_file.clone()).state() {
        return Err(SchedulerError::AlreadyRunning {
            name: options.name.clone(),
            pid,
        }
        .into());
    }

    if !options.foreground {
        match fork::daemonize()? {
            fork::Detached::Launcher { child } => {
                let timeout = Duration::from_secs(config.startup_timeout_secs);
                let pid = fork::await_daemon(child, &paths, timeout)?;
                println!(
                    "Scheduler '{}' started as daemon with PID {}",
                    options.name, pid
                );
                return Ok(());
            }
            fork::Detached::Daemon => {}
        }
    }

    let log_file = (!options.foreground).then_some(paths.log_file.as_path());
    let _guard = init_tracing(options.verbose, log_file);
    log_config_source(source.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let scheduler = Scheduler::new(
        options.name.clone(),
        interval,
        executor,
        paths.status_file.clone(),
    )?
    .with_daemon_mode(!options.foreground)
    .with_failure_policy(FailurePolicy::from(&config));

    if options.foreground {
        tracing::info!("Running in foreground mode. Press Ctrl+C to stop.");
    }

    let instance_options = InstanceOptions {
        handle_signals: true,
        io_timeout: Duration::from_millis(config.command_timeout_ms),
    };
    runtime.block_on(run_instance(scheduler, &paths, instance_options))?;
    Ok(())
}
