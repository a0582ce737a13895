use std::fmt;

use serde::{Deserialize, Serialize};

/// Every failure surfaced to a tool caller carries one of these kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionError,
    InitializationError,
    AcquisitionError,
    SessionNotReady,
    InvalidCoordinate,
    DegenerateWaypoints,
    InconsistentDimensionality,
    InsufficientSamples,
    InvalidParameter,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::InitializationError => "InitializationError",
            ErrorKind::AcquisitionError => "AcquisitionError",
            ErrorKind::SessionNotReady => "SessionNotReady",
            ErrorKind::InvalidCoordinate => "InvalidCoordinate",
            ErrorKind::DegenerateWaypoints => "DegenerateWaypoints",
            ErrorKind::InconsistentDimensionality => "InconsistentDimensionality",
            ErrorKind::InsufficientSamples => "InsufficientSamples",
            ErrorKind::InvalidParameter => "InvalidParameter",
        }
    }

    /// Precondition violations are the caller's to fix; the rest are faults
    /// on the instrument side.
    pub fn is_precondition(self) -> bool {
        !matches!(
            self,
            ErrorKind::ConnectionError
                | ErrorKind::InitializationError
                | ErrorKind::AcquisitionError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precondition violations raised by the planner, session and pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("session not ready: {0}")]
    SessionNotReady(String),
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
    #[error("degenerate waypoints: {0}")]
    DegenerateWaypoints(String),
    #[error("inconsistent dimensionality: {0}")]
    InconsistentDimensionality(String),
    #[error("insufficient samples: {0}")]
    InsufficientSamples(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SessionNotReady(_) => ErrorKind::SessionNotReady,
            Error::InvalidCoordinate(_) => ErrorKind::InvalidCoordinate,
            Error::DegenerateWaypoints(_) => ErrorKind::DegenerateWaypoints,
            Error::InconsistentDimensionality(_) => ErrorKind::InconsistentDimensionality,
            Error::InsufficientSamples(_) => ErrorKind::InsufficientSamples,
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
        }
    }

    /// The human-readable part without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            Error::SessionNotReady(d)
            | Error::InvalidCoordinate(d)
            | Error::DegenerateWaypoints(d)
            | Error::InconsistentDimensionality(d)
            | Error::InsufficientSamples(d)
            | Error::InvalidParameter(d) => d,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
