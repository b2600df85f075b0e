use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// stderr subscriber; `RUST_LOG` wins over the CLI verbosity when set.
pub fn init_tracing(verbosity: Verbosity) {
    let default_level = match verbosity {
        Verbosity::Quiet => "warn",
        Verbosity::Normal => "info",
        Verbosity::Verbose => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mass_replace={default_level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Append-only record of key occurrences inside binary files, which are
/// reported but never rewritten.
#[derive(Debug, Clone)]
pub struct BinaryMatchLog {
    path: PathBuf,
}

impl BinaryMatchLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_match(&self, file: &str, key: &str, offset: usize) -> Result<()> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".into());
        let mut log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(
            log,
            "{timestamp} - MATCH: File: {file}, Key: '{key}', Offset: {offset}"
        )
        .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }
}
