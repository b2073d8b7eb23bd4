//! Error types.

use std::fmt;
use thiserror::Error;

/// Result alias for resolver operations.
pub type Result<T> = std::result::Result<T, ResolverError>;

/// Errors returned synchronously by resolver operations.
///
/// Resolution failures are not represented here: they are delivered to the
/// query's callback as an [`ErrorCode`].
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The transport provider could not allocate a fresh context.
    #[error("failed to allocate transport context")]
    OutOfMemory,

    /// The transport context could not be initialised.
    #[error("failed to initialize transport context: {0}")]
    Init(#[source] std::io::Error),

    /// The transport socket could not be opened.
    #[error("failed to open transport socket: {0}")]
    Io(#[source] std::io::Error),

    /// Waiting for the socket to become readable failed.
    #[error("failed to poll resolver socket: {0}")]
    Poll(#[source] std::io::Error),

    /// A call was made with arguments the resolver cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transport rejected a query at submission time.
    #[error("query submission rejected: {0}")]
    Submission(ErrorCode),
}

impl ResolverError {
    /// Returns `true` for errors raised while constructing or opening a
    /// resolver. These are fatal to that resolver instance.
    #[must_use]
    pub const fn is_construction(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::Init(_) | Self::Io(_))
    }

    /// Returns the transport code for a rejected submission.
    #[must_use]
    pub const fn submission_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Submission(code) => Some(*code),
            _ => None,
        }
    }
}

/// Transport-level outcome codes, numerically compatible with udns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No reply in time, or every nameserver failed.
    TemporaryFailure,
    /// The reply could not be understood.
    ProtocolError,
    /// The domain does not exist (NXDOMAIN).
    NameNotFound,
    /// The domain exists but has no records of the requested type.
    NoData,
    /// The transport ran out of resources.
    OutOfMemory,
    /// The query itself was malformed.
    BadQuery,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::TemporaryFailure => -1,
            Self::ProtocolError => -2,
            Self::NameNotFound => -3,
            Self::NoData => -4,
            Self::OutOfMemory => -5,
            Self::BadQuery => -6,
        }
    }

    /// Maps a numeric code back to its variant.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::TemporaryFailure),
            -2 => Some(Self::ProtocolError),
            -3 => Some(Self::NameNotFound),
            -4 => Some(Self::NoData),
            -5 => Some(Self::OutOfMemory),
            -6 => Some(Self::BadQuery),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TemporaryFailure => "temporary failure",
            Self::ProtocolError => "protocol error",
            Self::NameNotFound => "name not found",
            Self::NoData => "no data",
            Self::OutOfMemory => "out of memory",
            Self::BadQuery => "bad query",
        })
    }
}

/// Numeric code of [`ErrorCode::TemporaryFailure`].
pub const TEMPORARY_FAILURE: i32 = ErrorCode::TemporaryFailure.code();
/// Numeric code of [`ErrorCode::ProtocolError`].
pub const PROTOCOL_ERROR: i32 = ErrorCode::ProtocolError.code();
/// Numeric code of [`ErrorCode::NameNotFound`].
pub const NAME_NOT_FOUND: i32 = ErrorCode::NameNotFound.code();
/// Numeric code of [`ErrorCode::NoData`].
pub const NO_DATA: i32 = ErrorCode::NoData.code();
/// Numeric code of [`ErrorCode::OutOfMemory`].
pub const OUT_OF_MEMORY: i32 = ErrorCode::OutOfMemory.code();
/// Numeric code of [`ErrorCode::BadQuery`].
pub const BAD_QUERY: i32 = ErrorCode::BadQuery.code();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [
            TEMPORARY_FAILURE,
            PROTOCOL_ERROR,
            NAME_NOT_FOUND,
            NO_DATA,
            OUT_OF_MEMORY,
            BAD_QUERY,
        ] {
            assert_eq!(ErrorCode::from_code(code).map(ErrorCode::code), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }

    #[test]
    fn construction_errors_are_classified() {
        assert!(ResolverError::OutOfMemory.is_construction());
        assert!(ResolverError::Io(std::io::ErrorKind::AddrInUse.into()).is_construction());
        assert!(!ResolverError::InvalidArgument("x".into()).is_construction());
        assert_eq!(
            ResolverError::Submission(ErrorCode::BadQuery).submission_code(),
            Some(ErrorCode::BadQuery)
        );
    }
}
