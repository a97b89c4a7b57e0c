//! Error taxonomy for the bot runtime.
//!
//! Only configuration, connection and trust-store faults escape to the caller
//! of [`crate::bot::Bot::run`]. Handler and periodic-task failures are contained
//! by [`crate::tasks::TaskGroup`] and never show up here.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// A handler or periodic task name was registered twice.
    #[error("duplicate handler or periodic task name: {name}")]
    DuplicateName { name: String },

    /// A pattern trigger failed to compile.
    #[error("invalid pattern for handler {name}: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// The configured CA bundle could not be read or contained no certificates.
    #[error("failed to load trust store {}: {source}", path.display())]
    TrustStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    /// No data arrived within the receive timeout while running in strict mode.
    #[error("no data received for {} seconds", .0.as_secs())]
    Idle(Duration),

    /// The server closed the connection while running in strict mode.
    #[error("connection closed by server")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BotError> = std::result::Result<T, E>;
