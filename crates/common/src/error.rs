//! Error types for kvmdeck

use thiserror::Error;

/// Result type alias using the kvmdeck Error
pub type Result<T> = std::result::Result<T, Error>;

/// kvmdeck error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hypervisor unreachable: {0}")]
    Connectivity(String),

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} {id}")]
    Conflict { kind: String, id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Step '{step}' failed ({}): {cause}", compensation_label(.compensated))]
    PartialFailure {
        step: String,
        compensated: bool,
        #[source]
        cause: Box<Error>,
    },

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Clone failed: {0}")]
    Clone(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },
}

fn compensation_label(compensated: &bool) -> &'static str {
    if *compensated {
        "compensated"
    } else {
        "not compensated"
    }
}

/// Coarse error category, stable across variants that share a meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    NotFound,
    Validation,
    Conflict,
    Precondition,
    PartialFailure,
    Hypervisor,
    Internal,
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn conflict(kind: &str, id: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connectivity(_) | Error::Timeout { .. } => ErrorKind::Connectivity,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Validation(_) | Error::Unsupported(_) => ErrorKind::Validation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::Hypervisor(_) | Error::Clone(_) => ErrorKind::Hypervisor,
            Error::Io(_) | Error::Serialization(_) | Error::Definition(_) | Error::Storage(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The error that ended a multi-step workflow, looking through compensation wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::PartialFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
