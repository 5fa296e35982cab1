pub mod ctl;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::daemon::{self, StartOptions};
use crate::step::CommandStep;

/// Instance name used when `--name` is not given.
pub const DEFAULT_NAME: &str = "scheduler";

/// Ithaca Scheduler - run a shell command on a fixed interval
#[derive(Parser, Debug)]
#[command(
    name = "ithaca-scheduler",
    version,
    about = "Ithaca Scheduler - run a shell command on a fixed interval, in the foreground or as a daemon"
)]
pub struct Cli {
    /// Shell command executed once per interval (via `sh -c`)
    #[arg(long)]
    pub cmd: String,

    /// Shell command executed instead of --cmd until the first successful step
    #[arg(long = "init-cmd")]
    pub init_cmd: Option<String>,

    /// Kill a step command that runs longer than this many seconds
    #[arg(long = "step-timeout", value_parser = clap::value_parser!(u64).range(1..))]
    pub step_timeout: Option<u64>,

    /// Seconds between steps (default from config, 3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,

    /// Instance name; namespaces the PID, status, socket and log files
    #[arg(short = 'n', long, default_value = DEFAULT_NAME)]
    pub name: String,

    /// Run in foreground (don't daemonize)
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Path to configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Directory for the PID, status and socket files
    #[arg(long = "runtime-dir")]
    pub runtime_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn step(&self) -> CommandStep {
        let mut step = CommandStep::new(self.cmd.as_str());
        if let Some(init) = &self.init_cmd {
            step = step.with_init(init.as_str());
        }
        if let Some(secs) = self.step_timeout {
            step = step.with_timeout(Duration::from_secs(secs));
        }
        step
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            name: self.name.clone(),
            interval_secs: self.interval,
            foreground: self.foreground,
            config_path: self.config.clone(),
            runtime_dir: self.runtime_dir.clone(),
            verbose: self.verbose,
        }
    }
}

/// Start the scheduler described by the command line. Blocks in foreground
/// mode; returns after the daemon hand-off otherwise.
pub fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    daemon::start(cli.start_options(), Arc::new(cli.step()))
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepExecutor;

    #[test]
    fn test_cli_version_flag() {
        let result = Cli::try_parse_from(["ithaca-scheduler", "--version"]);
        let err = result.expect_err("--version exits early");
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains("0.1.0"), "got: {}", err);
    }

    #[test]
    fn test_cli_requires_cmd() {
        let err = Cli::try_parse_from(["ithaca-scheduler"]).expect_err("missing --cmd");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["ithaca-scheduler", "--cmd", "true"]).expect("parse");
        assert_eq!(cli.name, "scheduler");
        assert!(!cli.foreground, "daemon mode is the default");
        assert!(cli.interval.is_none());
        assert!(cli.init_cmd.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_all_flags() {
        let cli = Cli::try_parse_from([
            "ithaca-scheduler",
            "--cmd",
            "make sync",
            "--init-cmd",
            "make bootstrap",
            "--step-timeout",
            "30",
            "--interval",
            "60",
            "-n",
            "nightly",
            "-f",
            "--runtime-dir",
            "/run/ithaca",
            "-v",
        ])
        .expect("parse");

        assert_eq!(cli.interval, Some(60));
        assert!(cli.foreground);

        let options = cli.start_options();
        assert_eq!(options.name, "nightly");
        assert_eq!(options.interval_secs, Some(60));
        assert_eq!(options.runtime_dir, Some(PathBuf::from("/run/ithaca")));
        assert!(options.verbose);

        let step = cli.step();
        assert!(step.has_init());
        assert!(step.describe().contains("make bootstrap"));
    }

    #[test]
    fn test_cli_rejects_zero_interval() {
        let result = Cli::try_parse_from(["ithaca-scheduler", "--cmd", "true", "--interval", "0"]);
        assert!(result.is_err(), "interval must be at least 1");
    }
}
