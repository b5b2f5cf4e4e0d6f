//! Typed openers, one per protocol.
//!
//! Each opener is a thin newtype over [`Socket`] that fixes the protocol at
//! construction. It dereferences to the socket for everything else, and a
//! plain socket converts back with `TryFrom`, which rejects a mismatched
//! protocol with `InvalidProtocol`.

use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::protocol::Protocol;
use nanoweave_proto::Socket;
use tracing::debug;

fn check_protocol(socket: &Socket, expected: Protocol) -> Result<()> {
    if socket.protocol() == expected {
        return Ok(());
    }
    debug!(
        "[SOCKET] {} is not a {} socket",
        socket.protocol(),
        expected
    );
    Err(WeaveError::invalid_protocol(format!(
        "expected a {expected} socket, got {}",
        socket.protocol()
    )))
}

macro_rules! typed_socket {
    ($(#[$meta:meta])* $name:ident => $protocol:ident) => {
        $(#[$meta])*
        pub struct $name {
            socket: ::nanoweave_proto::Socket,
        }

        impl $name {
            /// The protocol this opener produces.
            pub const PROTOCOL: ::nanoweave_core::protocol::Protocol =
                ::nanoweave_core::protocol::Protocol::$protocol;

            /// Open with default options.
            pub fn open(
                engine: &::nanoweave_core::transport::Engine,
            ) -> ::nanoweave_core::error::Result<Self> {
                Self::with_options(engine, ::nanoweave_core::options::SocketOptions::default())
            }

            /// Open with the given options.
            pub fn with_options(
                engine: &::nanoweave_core::transport::Engine,
                options: ::nanoweave_core::options::SocketOptions,
            ) -> ::nanoweave_core::error::Result<Self> {
                let opener = ::nanoweave_core::protocol::Opener::new(Self::PROTOCOL);
                Ok(Self { socket: ::nanoweave_proto::Socket::open(engine, opener, options)? })
            }

            /// Open in raw mode: no state machine, no contexts.
            pub fn raw(
                engine: &::nanoweave_core::transport::Engine,
            ) -> ::nanoweave_core::error::Result<Self> {
                let opener = ::nanoweave_core::protocol::Opener::raw(Self::PROTOCOL);
                Ok(Self {
                    socket: ::nanoweave_proto::Socket::open(
                        engine,
                        opener,
                        ::nanoweave_core::options::SocketOptions::default(),
                    )?,
                })
            }

            /// Start a builder for this protocol. Convert the built socket
            /// back with `try_into`.
            pub fn builder(
                engine: &::nanoweave_core::transport::Engine,
            ) -> ::nanoweave_proto::SocketBuilder {
                ::nanoweave_proto::Socket::builder(engine, Self::PROTOCOL)
            }

            /// Unwrap the underlying socket.
            pub fn into_inner(self) -> ::nanoweave_proto::Socket {
                self.socket
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = ::nanoweave_proto::Socket;

            fn deref(&self) -> &Self::Target {
                &self.socket
            }
        }

        impl ::std::convert::TryFrom<::nanoweave_proto::Socket> for $name {
            type Error = ::nanoweave_core::error::WeaveError;

            fn try_from(socket: ::nanoweave_proto::Socket) -> ::std::result::Result<Self, Self::Error> {
                $crate::sockets::check_protocol(&socket, Self::PROTOCOL)?;
                Ok(Self { socket })
            }
        }

        impl ::std::convert::From<$name> for ::nanoweave_proto::Socket {
            fn from(typed: $name) -> Self {
                typed.socket
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.socket).finish()
            }
        }
    };
}

mod pair;
mod pipeline;
mod pubsub;
mod reqrep;
mod survey;

pub use pair::{Pair0, Pair1};
pub use pipeline::{Pull0, Push0};
pub use pubsub::{Pub0, Sub0};
pub use reqrep::{Rep0, Req0};
pub use survey::{Respondent0, Surveyor0};
