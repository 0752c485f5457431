use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type shared by the server core.  Worker threads never let one of
/// these cross their boundary; they log it and transition to `Closed`.
/// Only the startup path (config assembly, socket binding, ring
/// initialization) propagates errors up to `main`.
///
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration error in {file} line {line}: {reason}")]
    ConfigLine {
        file: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("bad CIDR entry '{0}': {1}")]
    BadNetwork(String, String),

    #[error("bad stream limit pattern '{0}': {1}")]
    BadPattern(String, regex::Error),

    #[error("cannot bind endpoint {0}: {1}")]
    Bind(String, io::Error),

    #[error("ring initialization failed: {0}")]
    RingInit(String),

    #[error("ring recovery failed: {0}")]
    RingRecovery(String),

    #[error("unsupported packet buffer version {0}")]
    RingVersion(u32),

    #[error("transfer log error: {0}")]
    TransferLog(io::Error),

    #[error("signal dispatcher error: {0}")]
    Signals(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Shorthand for a fatal configuration complaint that is not tied to
    /// a particular file line.
    pub fn config<S: Into<String>>(reason: S) -> ServerError {
        ServerError::Config(reason.into())
    }
}
