//! nanoweave Core
//!
//! This crate contains the protocol-agnostic building blocks:
//! - Error types (`error`)
//! - Address parsing (`endpoint`)
//! - Protocol ids, peer compatibility and openers (`protocol`)
//! - Object ids (`ids`)
//! - Messages with protocol headers (`message`)
//! - Typed and keyed socket options (`options`)
//! - Topic prefix filters (`subscription`)
//! - Dialer reconnect backoff (`reconnect`)
//! - Lifecycle events (`monitor`)
//! - Engine timer thread (`timer`)
//! - In-memory transport engine (`transport`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
pub mod endpoint;
pub mod error;
pub mod ids;
pub mod message;
pub mod monitor;
pub mod options;
pub mod protocol;
pub mod reconnect;
pub mod subscription;
pub mod timer;
pub mod transport;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{ErrorKind, Result, WeaveError};
    pub use crate::ids::{ContextId, DialerId, ListenerId, PipeId, SocketId};
    pub use crate::message::Message;
    pub use crate::monitor::{SocketEvent, SocketMonitor};
    pub use crate::options::{OptionKey, OptionValue, SocketOptions};
    pub use crate::protocol::{Opener, Protocol};
    pub use crate::reconnect::ReconnectState;
    pub use crate::subscription::SubscriptionSet;
    pub use crate::transport::{Acceptor, Engine, Link, PipeHandler};
}
