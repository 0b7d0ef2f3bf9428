mod catalog;
mod cli;
mod command;
mod engine;
mod error;
mod logging;
mod model;
mod orchestrator;
mod session;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_pipeline = args.is_pipeline();
    if let Some(path) = logging::init(&args)? {
        tracing::info!(log = %path.display(), "ipa-extract starting");
    }

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success in pipeline modes
            if is_pipeline {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("{e:#}");
            Err(e)
        }
    }
}
