//! Socket event monitoring.
//!
//! Every socket can hand out any number of monitor receivers; each receives
//! all lifecycle events emitted after it was created.

use crate::endpoint::Endpoint;
use crate::ids::{DialerId, ListenerId, PipeId};
use std::fmt;

/// Socket lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A listener was bound.
    Listening { listener: ListenerId, endpoint: Endpoint },

    /// A listener was closed and its address released.
    ListenerClosed { listener: ListenerId, endpoint: Endpoint },

    /// A dialer started connecting.
    Dialing { dialer: DialerId, endpoint: Endpoint },

    /// A dialer was closed.
    DialerClosed { dialer: DialerId, endpoint: Endpoint },

    /// A connection attempt failed; background dialers retry.
    ConnectFailed {
        dialer: DialerId,
        endpoint: Endpoint,
        reason: String,
    },

    /// A pipe joined the socket.
    PipeAdded { pipe: PipeId, endpoint: Endpoint },

    /// A pipe left the socket.
    PipeRemoved { pipe: PipeId, endpoint: Endpoint },

    /// The socket was closed. Always the last event.
    Closed,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { listener, endpoint } => write!(f, "{listener} listening on {endpoint}"),
            Self::ListenerClosed { listener, endpoint } => {
                write!(f, "{listener} closed on {endpoint}")
            }
            Self::Dialing { dialer, endpoint } => write!(f, "{dialer} dialing {endpoint}"),
            Self::DialerClosed { dialer, endpoint } => write!(f, "{dialer} closed for {endpoint}"),
            Self::ConnectFailed {
                dialer,
                endpoint,
                reason,
            } => write!(f, "{dialer} failed to connect to {endpoint}: {reason}"),
            Self::PipeAdded { pipe, endpoint } => write!(f, "{pipe} added via {endpoint}"),
            Self::PipeRemoved { pipe, endpoint } => write!(f, "{pipe} removed from {endpoint}"),
            Self::Closed => f.write_str("socket closed"),
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sender half kept by the socket.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}
