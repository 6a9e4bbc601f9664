//! Error taxonomy for the connection lifecycle subsystem.
//!
//! Mirrors the shape of a typical boxed-kind error: a small public
//! [`ErrorCode`] enum for programmatic matching, and an opaque [`Error`]
//! that additionally carries an optional source error and is cheap to
//! move around (one pointer).

use std::cell::Cell;
use std::fmt;

/// Stable, contiguous error-code namespace for this crate and the
/// protocol layers built on top of it.
///
/// Numeric values are part of the crate's public contract and must not
/// be renumbered across a minor release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    InvalidArgument = 1,
    InvalidState = 2,
    ConnectionClosed = 3,
    SwitchedProtocols = 4,
    UnsupportedProtocol = 5,
    ReactionRequired = 6,
    CallbackFailure = 7,
    ServerClosed = 8,
    ProtocolError = 9,
    StreamClosed = 10,
    InvalidFrameSize = 11,
    ConnectionManagerShuttingDown = 12,
    ConnectionManagerInvalidStateForAcquire = 13,
    WebsocketUpgradeFailed = 14,
    InvalidHeader = 15,
    InvalidMethod = 16,
    InvalidPath = 17,
    Unknown = 99,
}

impl ErrorCode {
    fn description(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::InvalidState => "operation invalid in current state",
            Self::ConnectionClosed => "connection closed",
            Self::SwitchedProtocols => "connection switched protocols",
            Self::UnsupportedProtocol => "unsupported protocol",
            Self::ReactionRequired => "caller did not react to a required callback",
            Self::CallbackFailure => "user callback reported failure",
            Self::ServerClosed => "server is shutting down or closed",
            Self::ProtocolError => "protocol error",
            Self::StreamClosed => "stream closed",
            Self::InvalidFrameSize => "invalid frame size",
            Self::ConnectionManagerShuttingDown => "connection manager shutting down",
            Self::ConnectionManagerInvalidStateForAcquire => {
                "connection manager in invalid state for acquire"
            }
            Self::WebsocketUpgradeFailed => "websocket upgrade failed",
            Self::InvalidHeader => "invalid HTTP header",
            Self::InvalidMethod => "invalid HTTP method",
            Self::InvalidPath => "invalid HTTP path",
            Self::Unknown => "unknown error",
        }
    }

    /// Whether this code belongs to the header/method/path request
    /// validation category.
    pub fn is_request_validation_failure(self) -> bool {
        matches!(
            self,
            Self::InvalidHeader | Self::InvalidMethod | Self::InvalidPath
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct ErrorImpl {
    code: ErrorCode,
    cause: Option<BoxError>,
}

/// The error type returned by fallible entry points in this crate.
///
/// Cheap to construct and move: the payload lives on the heap behind a
/// single `Box`, so `Error` itself is one pointer wide.
pub struct Error {
    inner: Box<ErrorImpl>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        let err = Self {
            inner: Box::new(ErrorImpl { code, cause: None }),
        };
        LAST_ERROR.with(|cell| cell.set(code));
        err
    }

    pub fn with_cause<E>(code: ErrorCode, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        let err = Self {
            inner: Box::new(ErrorImpl {
                code,
                cause: Some(cause.into()),
            }),
        };
        LAST_ERROR.with(|cell| cell.set(code));
        err
    }

    pub fn code(&self) -> ErrorCode {
        self.inner.code
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.inner.code == ErrorCode::InvalidArgument
    }

    pub fn is_invalid_state(&self) -> bool {
        self.inner.code == ErrorCode::InvalidState
    }

    pub fn is_connection_closed(&self) -> bool {
        self.inner.code == ErrorCode::ConnectionClosed
    }

    pub fn is_unsupported_protocol(&self) -> bool {
        self.inner.code == ErrorCode::UnsupportedProtocol
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("protomux::Error");
        builder.field("code", &self.inner.code);
        if let Some(cause) = &self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.code.description())?;
        if let Some(cause) = &self.inner.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: Cell<ErrorCode> = const { Cell::new(ErrorCode::Unknown) };
}

/// Returns the error code most recently raised on the calling thread.
///
/// Provided for parity with conventions in libraries that expose a
/// `last_error()` accessor alongside returned `Result`s. Prefer the
/// returned `Result` itself; this is a fallback for call sites that
/// cannot easily thread one through.
pub fn last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| cell.get())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = Error::with_cause(ErrorCode::ProtocolError, "bad frame");
        let text = err.to_string();
        assert!(text.contains("protocol error"));
        assert!(text.contains("bad frame"));
    }

    #[test]
    fn last_error_tracks_most_recent() {
        let _ = Error::new(ErrorCode::InvalidArgument);
        assert_eq!(last_error(), ErrorCode::InvalidArgument);
        let _ = Error::new(ErrorCode::ServerClosed);
        assert_eq!(last_error(), ErrorCode::ServerClosed);
    }

    #[test]
    fn predicates_match_code() {
        let err = Error::new(ErrorCode::InvalidState);
        assert!(err.is_invalid_state());
        assert!(!err.is_invalid_argument());
    }

    #[test]
    fn discriminants_are_pinned() {
        assert_eq!(ErrorCode::InvalidArgument as u32, 1);
        assert_eq!(ErrorCode::UnsupportedProtocol as u32, 5);
        assert_eq!(ErrorCode::WebsocketUpgradeFailed as u32, 14);
        assert_eq!(ErrorCode::InvalidHeader as u32, 15);
        assert_eq!(ErrorCode::InvalidMethod as u32, 16);
        assert_eq!(ErrorCode::InvalidPath as u32, 17);
        assert_eq!(ErrorCode::Unknown as u32, 99);
    }

    #[test]
    fn request_validation_codes_are_flagged() {
        assert!(ErrorCode::InvalidHeader.is_request_validation_failure());
        assert!(ErrorCode::InvalidMethod.is_request_validation_failure());
        assert!(ErrorCode::InvalidPath.is_request_validation_failure());
        assert!(!ErrorCode::ProtocolError.is_request_validation_failure());
    }
}
