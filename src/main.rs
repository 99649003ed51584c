//! broker-bench - lifecycle driver for ephemeral messaging-cluster
//! load-testing experiments

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = args.run().await {
        tracing::error!(error = %e, "broker-bench failed");
        std::process::exit(e.exit_code());
    }
}
