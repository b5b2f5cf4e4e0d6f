//! # nanoweave protocols
//!
//! Scalability-protocol sockets over the in-memory engine from
//! `nanoweave-core`.
//!
//! ## Overview
//!
//! Every socket speaks one protocol:
//! - **pair0 / pair1**: one-to-one bidirectional (pair1 may be polyamorous)
//! - **pub0 / sub0**: broadcast with prefix subscriptions
//! - **req0 / rep0**: request/reply with resend and contexts
//! - **push0 / pull0**: load-balanced pipeline
//! - **surveyor0 / respondent0**: timed surveys with contexts
//!
//! Protocol logic lives in pure state machines (`protocol`); the socket
//! core drives them and parks callers until an operation can complete.
//! Each operation comes in three flavours that share that state:
//! blocking (`send`), non-blocking (`try_send`) and async (`send_async`).
//!
//! ## Quick Start
//!
//! ```rust
//! use nanoweave_core::options::SocketOptions;
//! use nanoweave_core::protocol::Protocol;
//! use nanoweave_core::transport::Engine;
//! use nanoweave_proto::Socket;
//!
//! let engine = Engine::new().unwrap();
//! let publisher = Socket::open(&engine, Protocol::Pub0, SocketOptions::default()).unwrap();
//! let subscriber = Socket::open(&engine, Protocol::Sub0, SocketOptions::default()).unwrap();
//! publisher.listen("inproc://quick").unwrap();
//! subscriber.dial("inproc://quick").unwrap();
//! subscriber.subscribe("weather").unwrap();
//!
//! publisher.send("sports: 3-1").unwrap();
//! publisher.send("weather: rain").unwrap();
//! assert_eq!(subscriber.recv().unwrap().as_bytes(), b"weather: rain");
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

#[macro_use]
mod conversation;

pub mod protocol;
pub mod socket_core;
pub mod waiter;

mod builder;
mod context;
mod dialer;
mod listener;
mod pipe;
mod socket;

pub use builder::SocketBuilder;
pub use context::Context;
pub use dialer::Dialer;
pub use listener::Listener;
pub use pipe::Pipe;
pub use socket::Socket;
pub use socket_core::{PipeInfo, PipeOrigin};
pub use waiter::{Mode, Pending, Ticket};

/// Prelude module for convenient imports
///
/// ```rust
/// use nanoweave_proto::prelude::*;
/// ```
pub mod prelude {
    pub use super::{Context, Dialer, Listener, Pipe, Socket, SocketBuilder};
    pub use bytes::Bytes;
    pub use nanoweave_core::prelude::*;
}
