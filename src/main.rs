//! gristmill CLI entry point.
//!
//! Thin composition layer: parse arguments, initialize logging, route the
//! command, translate failures into the documented exit codes.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gristmill::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "gristmill=info",
        1 => "gristmill=debug",
        _ => "gristmill=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(err) = cli::execute(cli.command).await {
        eprintln!("error: {err}");
        std::process::exit(cli::exit_code_for(&err));
    }
}
