// Controller subcommands: status, stop, pause, resume, interval, kill.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use super::DEFAULT_NAME;
use crate::control::client::send_command;
use crate::control::ControlCommand;
use crate::daemon::{self, is_process_alive, PidFile, PidState};
use crate::errors::SchedulerError;
use crate::models::{InstancePaths, SchedulerConfig, StatusSnapshot};
use crate::scheduler::store::read_snapshot;

/// Ithaca Scheduler controller
#[derive(Parser, Debug)]
#[command(
    name = "ithaca-ctl",
    version,
    about = "Control a running Ithaca Scheduler instance"
)]
pub struct CtlCli {
    /// Instance name
    #[arg(short = 'n', long, default_value = DEFAULT_NAME, global = true)]
    pub name: String,

    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the instance's PID, status and socket files
    #[arg(long = "runtime-dir", global = true)]
    pub runtime_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Subcommand, Debug)]
pub enum CtlCommand {
    /// Show scheduler status (read from the status file)
    Status {
        /// Print the raw status JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop the scheduler
    Stop,

    /// Pause stepping
    Pause,

    /// Resume stepping
    Resume,

    /// Change the step interval
    Interval {
        /// New interval in seconds
        #[arg(value_parser = clap::value_parser!(u64).range(1..))]
        seconds: u64,
    },

    /// Signal the scheduler process directly, bypassing the command socket
    Kill {
        /// Send SIGKILL instead of SIGTERM and remove the instance files
        #[arg(long)]
        force: bool,
    },
}

struct Target {
    config: SchedulerConfig,
    paths: InstancePaths,
}

impl Target {
    fn resolve(cli: &CtlCli) -> anyhow::Result<Self> {
        let config = daemon::load_config(cli.config.as_deref())?;
        let paths = daemon::instance_paths(&config, &cli.name, cli.runtime_dir.as_deref())?;
        Ok(Self { config, paths })
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms)
    }

    fn not_running(&self) -> anyhow::Error {
        SchedulerError::NotRunning(self.paths.name.clone()).into()
    }
}

/// Dispatch the controller command to the appropriate handler.
pub async fn dispatch(cli: &CtlCli) -> anyhow::Result<()> {
    let target = Target::resolve(cli)?;

    match &cli.command {
        CtlCommand::Status { json } => cmd_status(&target, *json),
        CtlCommand::Stop => cmd_send(&target, ControlCommand::Stop).await,
        CtlCommand::Pause => cmd_send(&target, ControlCommand::Pause).await,
        CtlCommand::Resume => cmd_send(&target, ControlCommand::Resume).await,
        CtlCommand::Interval { seconds } => {
            cmd_send(&target, ControlCommand::Interval(*seconds)).await
        }
        CtlCommand::Kill { force } => cmd_kill(&target, *force),
    }
}

/// ithaca-ctl status
///
/// Reads the status file rather than asking the server, so it works even
/// when the command server is wedged. Fails if the instance is not alive.
fn cmd_status(target: &Target, json: bool) -> anyhow::Result<()> {
    let snapshot = read_snapshot(&target.paths.status_file)
        .with_context(|| format!("Failed to read {}", target.paths.status_file.display()))?;
    let Some(snapshot) = snapshot else {
        return Err(target.not_running());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", format_status(&snapshot));
    }

    if !snapshot.running {
        return Err(target.not_running());
    }
    if !is_process_alive(snapshot.pid) {
        eprintln!(
            "Note: status file says running, but PID {} is gone; the snapshot is stale.",
            snapshot.pid
        );
        return Err(target.not_running());
    }
    Ok(())
}

fn format_time(t: Option<chrono::DateTime<chrono::Utc>>, missing: &str) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| missing.to_string())
}

pub fn format_status(snapshot: &StatusSnapshot) -> String {
    let mut out = format!("Scheduler '{}' Status:\n", snapshot.name);
    out.push_str(&format!("  Running: {}\n", snapshot.running));
    out.push_str(&format!("  Paused: {}\n", snapshot.paused));
    out.push_str(&format!(
        "  Mode: {}\n",
        if snapshot.daemon_mode {
            "daemon"
        } else {
            "foreground"
        }
    ));
    out.push_str(&format!("  Steps completed: {}\n", snapshot.step_count));
    if snapshot.failed_step_count > 0 {
        out.push_str(&format!(
            "  Failed steps: {} ({} in a row)\n",
            snapshot.failed_step_count, snapshot.consecutive_failures
        ));
    }
    out.push_str(&format!("  Uptime: {:.0} seconds\n", snapshot.uptime_seconds));
    out.push_str(&format!(
        "  Last run: {}\n",
        format_time(snapshot.last_run_time, "Never")
    ));
    out.push_str(&format!(
        "  Next run: {}\n",
        format_time(snapshot.next_run_time, "Unknown")
    ));
    out.push_str(&format!("  Interval: {} seconds\n", snapshot.interval_seconds));
    out.push_str(&format!("  PID: {}\n", snapshot.pid));
    out.push_str(&format!("  Executor: {}\n", snapshot.executor));
    out
}

/// ithaca-ctl stop | pause | resume | interval <n>
async fn cmd_send(target: &Target, command: ControlCommand) -> anyhow::Result<()> {
    let response = match send_command(
        &target.paths.socket,
        &command.to_wire(),
        target.io_timeout(),
    )
    .await
    {
        Ok(response) => response,
        Err(SchedulerError::NotRunning(_)) => return Err(target.not_running()),
        Err(e) => return Err(e.into()),
    };
    println!("{}", response);
    Ok(())
}

/// ithaca-ctl kill [--force]
fn cmd_kill(target: &Target, force: bool) -> anyhow::Result<()> {
    let pid_file = PidFile::new(target.paths.pid_file.clone());
    let pid = match pid_file.state() {
        PidState::Alive(pid) => pid,
        PidState::Absent => {
            eprintln!("PID file not found: {}", pid_file.path().display());
            return Err(target.not_running());
        }
        PidState::Stale => {
            eprintln!("Removing stale PID file {}", pid_file.path().display());
            pid_file.release()?;
            return Err(target.not_running());
        }
    };

    let (signal, signal_name) = if force {
        (libc::SIGKILL, "SIGKILL")
    } else {
        (libc::SIGTERM, "SIGTERM")
    };
    let raw_pid = libc::pid_t::try_from(pid).context("PID out of range")?;
    if unsafe { libc::kill(raw_pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to send {} to PID {}", signal_name, pid));
    }
    println!(
        "Sent {} to scheduler '{}' (PID {})",
        signal_name, target.paths.name, pid
    );

    if force {
        // The process gets no chance to clean up after SIGKILL.
        pid_file.release()?;
        match std::fs::remove_file(&target.paths.socket) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove {}", target.paths.socket.display())
                })
            }
        }
    }
    Ok(())
}
