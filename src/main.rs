use clap::Parser;

use ithaca_scheduler::cli::{self, Cli};

// Not #[tokio::main]: daemon mode forks, which has to happen before any
// runtime threads exist. `daemon::start` builds the runtime afterwards.
fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::dispatch(&cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
