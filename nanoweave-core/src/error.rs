//! nanoweave error types
//!
//! Every fallible operation in the workspace reports a [`WeaveError`]. The
//! variants map one-to-one onto the outcomes an application has to handle:
//! recoverable ones (`TryAgain`, `Timeout`) leave the socket untouched so a
//! retry is always safe, the rest describe a misuse or a terminal condition.

use std::io;
use thiserror::Error;

use crate::endpoint::EndpointError;

/// Main error type for nanoweave operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WeaveError {
    /// A non-blocking operation found nothing ready.
    #[error("operation would block, try again")]
    TryAgain,

    /// The configured deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The call violates the protocol's send/receive ordering.
    #[error("incorrect state: {0}")]
    BadState(String),

    /// Operation or option not valid for this protocol or direction.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Address already bound (listen) or already dialed by this socket.
    #[error("address in use: {0}")]
    AddressInUse(String),

    /// Malformed or unsupported address.
    #[error("address invalid: {0}")]
    AddressInvalid(String),

    /// Nobody accepted the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The object (or its owning socket) has been closed.
    #[error("object closed")]
    Closed,

    /// Malformed option value or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown protocol, inconsistent opener, or incompatible peer.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// OS-level failure while setting up engine resources.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Fieldless discriminant of [`WeaveError`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TryAgain,
    Timeout,
    BadState,
    NotSupported,
    AddressInUse,
    AddressInvalid,
    ConnectionRefused,
    Closed,
    InvalidArgument,
    InvalidProtocol,
    Io,
}

/// Result type alias for nanoweave operations
pub type Result<T> = std::result::Result<T, WeaveError>;

impl WeaveError {
    /// Create a bad-state error with a message
    pub fn bad_state(msg: impl Into<String>) -> Self {
        Self::BadState(msg.into())
    }

    /// Create a not-supported error with a message
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an invalid-argument error with a message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a connection-refused error for an address
    pub fn refused(addr: impl Into<String>) -> Self {
        Self::ConnectionRefused(addr.into())
    }

    /// Create an invalid-protocol error with a message
    pub fn invalid_protocol(msg: impl Into<String>) -> Self {
        Self::InvalidProtocol(msg.into())
    }

    /// The fieldless kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TryAgain => ErrorKind::TryAgain,
            Self::Timeout => ErrorKind::Timeout,
            Self::BadState(_) => ErrorKind::BadState,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::AddressInUse(_) => ErrorKind::AddressInUse,
            Self::AddressInvalid(_) => ErrorKind::AddressInvalid,
            Self::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            Self::Closed => ErrorKind::Closed,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidProtocol(_) => ErrorKind::InvalidProtocol,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if this error is an expected, retryable outcome.
    ///
    /// `TryAgain` and `Timeout` never change socket or context state.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TryAgain | Self::Timeout)
    }

    /// Check if this is a dial/listen failure
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::AddressInUse(_) | Self::AddressInvalid(_) | Self::ConnectionRefused(_)
        )
    }
}

impl From<EndpointError> for WeaveError {
    fn from(e: EndpointError) -> Self {
        Self::AddressInvalid(e.to_string())
    }
}

impl From<io::Error> for WeaveError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Self::TryAgain,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::AddrInUse => Self::AddressInUse(e.to_string()),
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(e.to_string()),
            io::ErrorKind::InvalidInput => Self::InvalidArgument(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}
