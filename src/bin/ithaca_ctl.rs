use clap::Parser;

use ithaca_scheduler::cli::ctl::{self, CtlCli};

#[tokio::main]
async fn main() {
    let cli = CtlCli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = ctl::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
