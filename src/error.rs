//! Error taxonomy shared by the whole crate.
//!
//! Every kind maps to a stable CLI exit code so scripts can distinguish
//! "board not found" from "firmware rejected" without parsing stderr.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Typed error carried through the board, task, and upload layers.
///
/// Variants are `Clone` because a task result may be observed by several
/// waiters; I/O errors are flattened to their message at conversion time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid argument or malformed user input.
    #[error("{0}")]
    Param(String),
    /// Value outside the acceptable range (e.g. firmware larger than flash).
    #[error("{0}")]
    Range(String),
    /// The capability is not available in the board's current mode.
    #[error("{0}")]
    Mode(String),
    /// Board, device, or file does not exist (anymore).
    #[error("{0}")]
    NotFound(String),
    /// Transport or filesystem I/O failure.
    #[error("{0}")]
    Io(String),
    /// Permission denied by the OS.
    #[error("{0}")]
    Access(String),
    /// Resource is held by someone else or in the wrong lifecycle state.
    #[error("{0}")]
    Busy(String),
    /// Firmware image is malformed or incompatible with the board.
    #[error("{0}")]
    Firmware(String),
    /// Format or backend that this build does not provide.
    #[error("{0}")]
    Unsupported(String),
    /// Everything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Other(_) => 1,
            Error::Param(_) => 2,
            Error::Range(_) => 3,
            Error::Mode(_) => 4,
            Error::NotFound(_) => 5,
            Error::Io(_) => 6,
            Error::Access(_) => 7,
            Error::Busy(_) => 8,
            Error::Firmware(_) => 9,
            Error::Unsupported(_) => 10,
        }
    }

    /// Short machine-readable name of the kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Param(_) => "param",
            Error::Range(_) => "range",
            Error::Mode(_) => "mode",
            Error::NotFound(_) => "not_found",
            Error::Io(_) => "io",
            Error::Access(_) => "access",
            Error::Busy(_) => "busy",
            Error::Firmware(_) => "firmware",
            Error::Unsupported(_) => "unsupported",
            Error::Other(_) => "other",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Error::Access(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}
