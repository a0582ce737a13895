use std::time::Duration;

use scope_core::ErrorKind;

/// Faults raised while talking to the remote instrument peer.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("peer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("initialization error: {0}")]
    Initialization(String),
    #[error("peer rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("acquisition error: {0}")]
    Acquisition(String),
    #[error(transparent)]
    Plan(#[from] scope_core::Error),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Connection(_) | PeerError::Timeout(_) => ErrorKind::ConnectionError,
            PeerError::Initialization(_) => ErrorKind::InitializationError,
            PeerError::Rejected { .. } | PeerError::Acquisition(_) => ErrorKind::AcquisitionError,
            PeerError::Plan(e) => e.kind(),
        }
    }

    /// The link itself is broken; the connection must be re-established.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, PeerError::Connection(_) | PeerError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Configuration file problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}
