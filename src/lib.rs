#[cfg(not(unix))]
compile_error!("ithaca-scheduler relies on Unix sockets, signals and fork and only builds on Unix");

pub mod cli;
pub mod control;
pub mod daemon;
pub mod errors;
pub mod models;
pub mod scheduler;
pub mod step;
