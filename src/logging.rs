use crate::cli::Cli;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Default log file location used by the TUI.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("ipa-extract").join("ipa-extract.log"))
}

/// Install the global tracing subscriber.
///
/// The TUI owns the terminal, so it logs to a file. Pipeline modes log to stderr
/// and stay quiet unless something goes wrong. `RUST_LOG` overrides either default.
/// Returns the log file path when logging to a file.
pub fn init(args: &Cli) -> Result<Option<PathBuf>> {
    if args.is_pipeline() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
        return Ok(None);
    }

    let path = match args.log_file.clone().or_else(default_log_path) {
        Some(p) => p,
        None => {
            // Nowhere to write; keep the terminal clean.
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::sink)
                .try_init();
            return Ok(None);
        }
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ipa_extract=info,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(Some(path))
}
