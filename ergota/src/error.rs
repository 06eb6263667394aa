//! Error types for ergota.

use crate::protocol::ResponseCode;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for ergota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ergota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device rejected a phase of the update, or the phase failed.
    #[error(transparent)]
    Ota(#[from] OtaError),

    /// Another call of the same kind is still running on this engine.
    #[error("Session busy: an {0} is already in progress")]
    SessionBusy(&'static str),

    /// I/O error (firmware file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Firmware image cannot be sent.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),
}

impl Error {
    /// The protocol error, if this is one.
    pub fn as_ota(&self) -> Option<&OtaError> {
        match self {
            Self::Ota(err) => Some(err),
            _ => None,
        }
    }
}

/// Phase of the update a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Begin was rejected, malformed or timed out.
    Begin,
    /// A window acknowledgment was not `Ok`.
    Package,
    /// End (digest check and install) was rejected.
    Install,
    /// The device rejected or ignored an abort.
    Abort,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "BeginError",
            Self::Package => "PackageError",
            Self::Install => "InstallError",
            Self::Abort => "AbortError",
        })
    }
}

/// What went wrong inside a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDetail {
    /// The device answered with a non-`Ok` code (or the wait timed out).
    Response(ResponseCode),
    /// The Begin answer did not have the expected shape.
    Malformed,
    /// The transport failed underneath the protocol.
    Unknown,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(code) => write!(f, "{code}"),
            Self::Malformed => f.write_str("malformed"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Failure of one OTA phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct OtaError {
    /// Phase that failed.
    pub kind: ErrorKind,
    /// Reason reported for the failure.
    pub detail: ErrorDetail,
}

impl OtaError {
    /// Create an error from its parts.
    pub fn new(kind: ErrorKind, detail: ErrorDetail) -> Self {
        Self { kind, detail }
    }

    /// The device answered `code` during `kind`.
    pub fn response(kind: ErrorKind, code: ResponseCode) -> Self {
        Self::new(kind, ErrorDetail::Response(code))
    }

    /// The transport failed during `kind`.
    pub fn unknown(kind: ErrorKind) -> Self {
        Self::new(kind, ErrorDetail::Unknown)
    }

    /// Response code carried by this error, if any.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self.detail {
            ErrorDetail::Response(code) => Some(code),
            _ => None,
        }
    }

    /// Message suitable for end users.
    ///
    /// Raw protocol codes are never shown; anything without a dedicated
    /// message falls back to "unknown error".
    pub fn user_message(&self) -> &'static str {
        match self.detail {
            ErrorDetail::Response(ResponseCode::TimeOut) => "device likely disconnected",
            ErrorDetail::Response(
                ResponseCode::ChecksumError
                | ResponseCode::IncorrectFormat
                | ResponseCode::IncorrectFirmwareSize,
            ) => "invalid firmware file",
            ErrorDetail::Response(ResponseCode::InternalStorageError) => "device storage error",
            ErrorDetail::Response(ResponseCode::NotOk) => "device rejected the request",
            ErrorDetail::Response(ResponseCode::Ok | ResponseCode::Unknown(_))
            | ErrorDetail::Malformed
            | ErrorDetail::Unknown => "unknown error",
        }
    }
}
