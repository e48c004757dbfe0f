//! Logging: `tracing` to the console and to the device log file the controller fetches with GetLog.
//!
//! Filter precedence: `ORCH_LOG`, then `RUST_LOG`, then the config `log` value.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Error type for logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open device log: {0}")]
    File(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

fn build_env_filter(default: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("ORCH_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    Ok(EnvFilter::try_new(default)?)
}

/// Open the device log for appending. Append mode keeps writes at the end after a truncate.
fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. Call once at startup.
pub fn init(default_filter: &str, log_path: &Path) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    let filter = build_env_filter(default_filter)?;
    let file = open_append(log_path)?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(io::stderr);
    let device_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(device_log)
        .try_init()?;
    Ok(())
}

/// The accumulated device log on disk.
#[derive(Debug, Clone)]
pub struct DeviceLog {
    path: PathBuf,
}

impl DeviceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate to zero length. The file is created if missing.
    pub async fn clear(&self) -> io::Result<()> {
        let f = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        f.sync_all().await
    }
}
