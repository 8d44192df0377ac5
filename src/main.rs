//! ClipShare - clipboard relay between machines
//!
//! Entry point for the `clipshare` binary.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipshare::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let handler = CliHandler::new(cli.config)?;

    // Initialize logging
    let log_level = if cli.verbose {
        "debug"
    } else {
        handler.config().log_level.as_str()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipshare={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("ClipShare v{}", clipshare::VERSION);
    debug!(
        "Built {} for {} ({})",
        env!("BUILD_DATE"),
        env!("TARGET"),
        env!("PROFILE")
    );

    handler.handle_command(cli.command).await?;

    Ok(())
}
