use std::path::PathBuf;

use thiserror::Error;

/// Everything the core can fail with. Mirrors the error kinds called out by the
/// system's error handling design: config and duplicate-daemon errors are fatal at
/// startup, transient source errors are retried, plugin/callback errors quarantine
/// only the offending plugin, and state I/O errors never abort the loop.
#[derive(Debug, Error)]
pub enum EventdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("event source unavailable: {0}")]
    TransientSource(String),

    #[error("failed to load plugin {path}: {reason}")]
    PluginLoad { path: PathBuf, reason: String },

    #[error("callback {callback} failed: {reason}")]
    Callback { callback: String, reason: String },

    #[error("durable state I/O failed: {0}")]
    StateIo(String),

    #[error("pid file already present; another daemon instance is running")]
    DuplicateDaemon,
}

pub type Result<T> = std::result::Result<T, EventdError>;
