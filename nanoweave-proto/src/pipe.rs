//! One live connection of a socket.

use std::fmt;
use std::sync::Arc;

use nanoweave_core::endpoint::Endpoint;
use nanoweave_core::error::Result;
use nanoweave_core::ids::{DialerId, ListenerId, PipeId};
use nanoweave_core::message::Message;
use nanoweave_core::protocol::Protocol;

use crate::dialer::Dialer;
use crate::listener::Listener;
use crate::socket_core::{PipeInfo, PipeOrigin, SocketCore};
use crate::waiter::Mode;

/// Handle to a pipe, taken from [`Socket::pipes`](crate::Socket::pipes).
///
/// Peer details are a snapshot taken when the handle was made; `is_open`
/// reflects live state. Per-pipe send and receive are only available in
/// modes that address peers individually (polyamorous `pair1`); elsewhere
/// they fail with `NotSupported`.
#[derive(Clone)]
pub struct Pipe {
    core: Arc<SocketCore>,
    info: PipeInfo,
}

impl Pipe {
    pub(crate) fn new(core: Arc<SocketCore>, info: PipeInfo) -> Self {
        Self { core, info }
    }

    #[inline]
    pub fn id(&self) -> PipeId {
        self.info.id
    }

    /// The address the connection was made to.
    pub fn remote_address(&self) -> &Endpoint {
        &self.info.address
    }

    pub fn peer_protocol(&self) -> Protocol {
        self.info.peer
    }

    /// The dialer that made this pipe, if it still exists.
    pub fn dialer(&self) -> Option<Dialer> {
        let PipeOrigin::Dialer(id) = self.info.origin else {
            return None;
        };
        self.core
            .dialers()
            .into_iter()
            .find(|(d, _)| *d == id)
            .map(|(d, endpoint)| Dialer::new(Arc::clone(&self.core), d, endpoint))
    }

    /// The listener that accepted this pipe, if it still exists.
    pub fn listener(&self) -> Option<Listener> {
        let PipeOrigin::Listener(id) = self.info.origin else {
            return None;
        };
        self.core
            .listeners()
            .into_iter()
            .find(|(l, _)| *l == id)
            .map(|(l, endpoint)| Listener::new(Arc::clone(&self.core), l, endpoint))
    }

    pub fn dialer_id(&self) -> Option<DialerId> {
        match self.info.origin {
            PipeOrigin::Dialer(id) => Some(id),
            PipeOrigin::Listener(_) => None,
        }
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        match self.info.origin {
            PipeOrigin::Listener(id) => Some(id),
            PipeOrigin::Dialer(_) => None,
        }
    }

    pub fn send(&self, msg: impl Into<Message>) -> Result<()> {
        self.core.pipe_send(self.info.id, msg.into(), Mode::Wait).wait()
    }

    pub fn try_send(&self, msg: impl Into<Message>) -> Result<()> {
        self.core.pipe_send(self.info.id, msg.into(), Mode::Poll).wait()
    }

    pub async fn send_async(&self, msg: impl Into<Message>) -> Result<()> {
        let ticket = self.core.pipe_send(self.info.id, msg.into(), Mode::Wait);
        ticket.wait_async().await
    }

    /// Receive the next message that arrived on this pipe.
    pub fn recv(&self) -> Result<Message> {
        self.core.pipe_recv(self.info.id, Mode::Wait).wait()
    }

    pub fn try_recv(&self) -> Result<Message> {
        self.core.pipe_recv(self.info.id, Mode::Poll).wait()
    }

    pub async fn recv_async(&self) -> Result<Message> {
        let ticket = self.core.pipe_recv(self.info.id, Mode::Wait);
        ticket.wait_async().await
    }

    /// Disconnect both ends. A dialer-made pipe is redialed.
    pub fn close(&self) {
        self.core.close_pipe(self.info.id);
    }

    pub fn is_open(&self) -> bool {
        self.core.has_pipe(self.info.id)
    }
}

impl PartialEq for Pipe {
    fn eq(&self, other: &Self) -> bool {
        self.info.id == other.info.id
    }
}

impl Eq for Pipe {}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.info.id)
            .field("address", &self.info.address)
            .field("peer", &self.info.peer)
            .field("origin", &self.info.origin)
            .finish()
    }
}
