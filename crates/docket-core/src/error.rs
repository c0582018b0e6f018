//! Error types for docket-core.

use thiserror::Error;

/// Result type for docket-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in docket-core.
///
/// Only `Startup`, `Connection` and `Execution` are meant to reach the user.
/// The remaining variants are produced by transport layers and get folded
/// into one of those three at the component boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The execution server failed to launch or never announced an endpoint.
    #[error("execution server failed to start: {0}")]
    Startup(String),

    /// The execution server or kernel could not be reached.
    #[error("session is not running: {0}")]
    Connection(String),

    /// The kernel reported an error while running a fragment.
    #[error("{0}")]
    Execution(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error talking to the server REST API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error on the kernel channel.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

impl Error {
    /// Fold a transport-level error into a `Connection` error.
    ///
    /// User-facing variants pass through untouched.
    pub fn into_connection(self) -> Self {
        match self {
            Self::Startup(_) | Self::Connection(_) | Self::Execution(_) => self,
            other => Self::Connection(other.to_string()),
        }
    }

    /// Single-line message with a recovery hint where one is known.
    pub fn with_hint(&self) -> String {
        match self {
            Self::Startup(_) => format!(
                "{self}\n  hint: check that the virtual environment contains bin/jupyter \
                 (pip install notebook), or pass --venv-dir"
            ),
            Self::Connection(_) => {
                format!("{self}\n  hint: run `:restart` or start the command again")
            }
            _ => self.to_string(),
        }
    }
}
