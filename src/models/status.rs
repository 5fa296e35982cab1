use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of a scheduler, as written to the status file and
/// returned by the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub running: bool,
    pub paused: bool,
    pub daemon_mode: bool,
    pub step_count: u64,
    pub interval_seconds: u64,
    pub start_time: Option<DateTime<Utc>>,
    /// Time of the last *successful* step.
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub uptime_seconds: f64,
    pub pid: u32,
    pub executor: String,
    #[serde(default)]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub failed_step_count: u64,
}
