// Command protocol: one text request, one text response per connection.

pub mod client;
pub mod server;

use crate::scheduler::SchedulerHandle;

pub const STOPPED_RESPONSE: &str = "Scheduler stopped";
pub const PAUSED_RESPONSE: &str = "Scheduler paused";
pub const RESUMED_RESPONSE: &str = "Scheduler resumed";
pub const INVALID_INTERVAL_RESPONSE: &str = "Invalid interval format. Use: interval <seconds>";

/// Largest request the server reads from one connection.
pub const MAX_REQUEST_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Stop,
    Pause,
    Resume,
    Interval(u64),
    InvalidInterval,
    Unknown(String),
}

impl ControlCommand {
    /// Parse one request line. Commands are case-sensitive; surrounding
    /// whitespace is ignored.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input {
            "status" => return ControlCommand::Status,
            "stop" => return ControlCommand::Stop,
            "pause" => return ControlCommand::Pause,
            "resume" => return ControlCommand::Resume,
            "interval" => return ControlCommand::InvalidInterval,
            _ => {}
        }

        if let Some(arg) = input.strip_prefix("interval ") {
            return match arg.trim().parse::<u64>() {
                Ok(seconds) if seconds >= 1 => ControlCommand::Interval(seconds),
                _ => ControlCommand::InvalidInterval,
            };
        }

        ControlCommand::Unknown(input.to_string())
    }

    /// Wire form, as sent by the controller.
    pub fn to_wire(&self) -> String {
        match self {
            ControlCommand::Status => "status".to_string(),
            ControlCommand::Stop => "stop".to_string(),
            ControlCommand::Pause => "pause".to_string(),
            ControlCommand::Resume => "resume".to_string(),
            ControlCommand::Interval(seconds) => format!("interval {}", seconds),
            ControlCommand::InvalidInterval => "interval".to_string(),
            ControlCommand::Unknown(raw) => raw.clone(),
        }
    }
}

/// Apply a command to the scheduler and build the response text.
pub async fn handle_command(handle: &SchedulerHandle, command: ControlCommand) -> String {
    match command {
        ControlCommand::Status => match serde_json::to_string_pretty(&handle.status()) {
            Ok(json) => json,
            Err(e) => format!("Command error: {}", e),
        },
        ControlCommand::Stop => {
            handle.shutdown().await;
            STOPPED_RESPONSE.to_string()
        }
        ControlCommand::Pause => {
            handle.pause().await;
            PAUSED_RESPONSE.to_string()
        }
        ControlCommand::Resume => {
            handle.resume().await;
            RESUMED_RESPONSE.to_string()
        }
        ControlCommand::Interval(seconds) => match handle.set_interval(seconds).await {
            Ok(()) => format!("Interval changed to {} seconds", seconds),
            Err(_) => INVALID_INTERVAL_RESPONSE.to_string(),
        },
        ControlCommand::InvalidInterval => INVALID_INTERVAL_RESPONSE.to_string(),
        ControlCommand::Unknown(raw) => format!("Unknown command: {}", raw),
    }
}
