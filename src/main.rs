//! stepql CLI — adaptive multi-step query planning.

use clap::Parser;
use stepql::cli::Cli;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = std::env::var("STEPQL_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = stepql::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
