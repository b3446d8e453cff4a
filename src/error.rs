//! Crate-level error type.
//!
//! Every fallible library operation returns [`ChatError`]. Variants carry
//! enough context (URL, path, status) to diagnose a failure from the log line
//! alone.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the chat client.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The configured origin cannot be turned into WebSocket/upload URLs.
    #[error("invalid origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    /// A configuration value is missing or out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file is not valid TOML for [`crate::config::ChatConfig`].
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Reading a configuration file or an attachment failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// WebSocket handshake or framing failure.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The HTTP request could not be built or sent.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server replied with a non-2xx status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The audio source (microphone) could not be opened or read.
    #[error("audio source unavailable: {0}")]
    AudioSource(String),

    /// A background task was cancelled or panicked before producing a result.
    #[error("background task aborted")]
    TaskAborted,
}

impl ChatError {
    /// Wrap an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChatError::Io {
            path: path.into(),
            source,
        }
    }
}
