//! Error types that can be emitted from this library

use std::io;

use thiserror::Error;

/// Generic result type with ZipError as its error variant
pub type ZipResult<T> = Result<T, ZipError>;

/// Error type for Zip
#[derive(Debug, Error)]
pub enum ZipError {
    /// An error caused by I/O
    #[error(transparent)]
    Io(#[from] io::Error),

    /// This file is probably not a zip archive. The detail is enclosed.
    #[error("invalid Zip archive: {0}")]
    InvalidArchive(&'static str),

    /// This archive is not supported. The reason is enclosed.
    #[error("unsupported Zip archive: {0}")]
    UnsupportedArchive(&'static str),

    /// The caller misused the API. The detail is enclosed.
    #[error("invalid usage: {0}")]
    InvalidUsage(&'static str),

    /// An internal invariant of the maybe-Mac state machine was violated.
    #[error("Logic failure. Please raise an issue.")]
    Logic,
}

impl ZipError {
    /// Convert into an `io::Error` carrying the same message, for use on
    /// the single error channel an `AsyncRead` chain has.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            ZipError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

pub(crate) fn unsupported_zip_error<T>(detail: &'static str) -> ZipResult<T> {
    Err(ZipError::UnsupportedArchive(detail))
}
