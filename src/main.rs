//! Docswarm - document processing swarm
//!
//! Chunks documents, routes each chunk to the worker whose capabilities fit
//! it best, deduplicates and evaluates the merged results and delivers a
//! report over the chosen channel.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docswarm::cli::{self, Cli};
use docswarm::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let filter = EnvFilter::from_default_env().add_directive(format!("docswarm={}", level).parse()?);
    if cli.log_json || config.general.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).compact())
            .with(filter)
            .init();
    }

    cli::run(cli, config).await
}
