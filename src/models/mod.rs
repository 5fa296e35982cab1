pub mod config;
pub mod paths;
pub mod status;

pub use config::SchedulerConfig;
pub use paths::InstancePaths;
pub use status::StatusSnapshot;
