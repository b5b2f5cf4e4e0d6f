//! # nanoweave
//!
//! Brokerless messaging sockets implementing the scalability protocols.
//!
//! ## Architecture
//!
//! nanoweave is structured as a **messaging kernel** with clean layering:
//!
//! - **`nanoweave-core`**: errors, addresses, options, messages and the
//!   in-memory transport [`Engine`] with its timer thread
//! - **`nanoweave-proto`**: pure protocol state machines and the socket core
//!   that drives them
//! - **`nanoweave`**: public API surface (this crate)
//!
//! ## Protocols
//!
//! | opener | peer | shape |
//! |---|---|---|
//! | [`Pair0`], [`Pair1`] | itself | one-to-one, bidirectional |
//! | [`Pub0`] | [`Sub0`] | broadcast, prefix filtered |
//! | [`Req0`] | [`Rep0`] | request/reply, one reply per request |
//! | [`Push0`] | [`Pull0`] | round-robin pipeline |
//! | [`Surveyor0`] | [`Respondent0`] | timed survey, many replies |
//!
//! ## Quick Start
//!
//! ```rust
//! use nanoweave::prelude::*;
//!
//! # fn main() -> nanoweave::Result<()> {
//! let engine = Engine::new()?;
//! let rep = Rep0::open(&engine)?;
//! let req = Req0::open(&engine)?;
//! rep.listen("inproc://quick-start")?;
//! req.dial("inproc://quick-start")?;
//!
//! req.send("ping")?;
//! let request = rep.recv()?;
//! rep.send(request.into_body())?;
//! assert_eq!(req.recv()?.as_bytes(), b"ping");
//! # Ok(())
//! # }
//! ```
//!
//! ## Calling conventions
//!
//! Every send and receive comes in three flavours over the same state:
//! `send`/`recv` block up to the socket's timeout, `try_send`/`try_recv`
//! fail with [`WeaveError::TryAgain`] instead of waiting, and
//! `send_async`/`recv_async` suspend only the calling task. The async
//! forms need no particular executor.
//!
//! ## Resource scoping
//!
//! [`Socket`] and [`Context`] close when dropped. `close()` is idempotent
//! and fails every blocked operation with [`WeaveError::Closed`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;
mod sockets;

pub use bytes::Bytes;

pub use nanoweave_core::endpoint::Endpoint;
pub use nanoweave_core::error::{ErrorKind, Result, WeaveError};
pub use nanoweave_core::ids::{ContextId, DialerId, ListenerId, PipeId, SocketId};
pub use nanoweave_core::message::Message;
pub use nanoweave_core::monitor::{SocketEvent, SocketMonitor};
pub use nanoweave_core::options::{OptionKey, OptionValue, SocketOptions};
pub use nanoweave_core::protocol::{Opener, Protocol};
pub use nanoweave_core::transport::Engine;

pub use nanoweave_proto::{Context, Dialer, Listener, Pipe, PipeOrigin, Socket, SocketBuilder};

pub use sockets::{Pair0, Pair1, Pub0, Pull0, Push0, Rep0, Req0, Respondent0, Sub0, Surveyor0};

/// Convenient imports.
///
/// # Example
///
/// ```rust
/// use nanoweave::prelude::*;
///
/// // Now you have:
/// // - Engine, Socket, Context, Dialer, Listener, Pipe
/// // - the typed openers (Req0, Rep0, Pub0, Sub0, ...)
/// // - Message, Bytes, SocketOptions, WeaveError
/// ```
pub mod prelude {
    pub use crate::sockets::{
        Pair0, Pair1, Pub0, Pull0, Push0, Rep0, Req0, Respondent0, Sub0, Surveyor0,
    };
    pub use crate::{
        Bytes, Context, Dialer, Engine, ErrorKind, Listener, Message, Opener, Pipe, Protocol,
        Socket, SocketOptions, WeaveError,
    };
}
