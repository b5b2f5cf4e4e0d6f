//! The protocol-typed endpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nanoweave_core::endpoint::Endpoint;
use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, SocketId};
use nanoweave_core::monitor::SocketMonitor;
use nanoweave_core::options::{OptionKey, OptionValue, SocketOptions};
use nanoweave_core::protocol::{Opener, Protocol};
use nanoweave_core::transport::Engine;

use crate::builder::SocketBuilder;
use crate::context::Context;
use crate::dialer::Dialer;
use crate::listener::Listener;
use crate::pipe::Pipe;
use crate::socket_core::SocketCore;

pub(crate) fn parse_address(addr: impl AsRef<[u8]>) -> Result<Endpoint> {
    Endpoint::from_bytes(addr).map_err(WeaveError::from)
}

/// A socket speaking one protocol.
///
/// Dropping the socket closes it, together with every dialer, listener,
/// pipe and context it owns.
///
/// ```
/// use nanoweave_core::options::SocketOptions;
/// use nanoweave_core::protocol::{Opener, Protocol};
/// use nanoweave_core::transport::Engine;
/// use nanoweave_proto::Socket;
///
/// let engine = Engine::new().unwrap();
/// let rep = Socket::open(&engine, Protocol::Rep0, SocketOptions::default()).unwrap();
/// let req = Socket::open(&engine, Opener::new(Protocol::Req0), SocketOptions::default()).unwrap();
/// rep.listen("inproc://doc-socket").unwrap();
/// req.dial("inproc://doc-socket").unwrap();
///
/// req.send("ping").unwrap();
/// assert_eq!(rep.recv().unwrap().as_bytes(), b"ping");
/// rep.send("pong").unwrap();
/// assert_eq!(req.recv().unwrap().as_bytes(), b"pong");
/// ```
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    /// Open a socket for `opener` on `engine`.
    pub fn open(engine: &Engine, opener: impl Into<Opener>, options: SocketOptions) -> Result<Self> {
        let core = SocketCore::open(engine, opener.into(), options)?;
        Ok(Self { core })
    }

    /// Start building a socket with listeners and dialers attached on open.
    pub fn builder(engine: &Engine, opener: impl Into<Opener>) -> SocketBuilder {
        SocketBuilder::new(engine, opener.into())
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.core.id()
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.core.protocol()
    }

    #[inline]
    pub fn opener(&self) -> Opener {
        self.core.opener()
    }

    pub fn is_raw(&self) -> bool {
        self.core.opener().is_raw()
    }

    pub fn engine(&self) -> &Engine {
        self.core.engine()
    }

    #[inline]
    fn context_id(&self) -> ContextId {
        ContextId::IMPLICIT
    }

    /// Dial `addr`, honouring the `block_on_dial` option.
    ///
    /// By default the first attempt is made right away: a refused
    /// connection (nobody listening yet) keeps the dialer retrying in the
    /// background, any other failure is returned.
    pub fn dial(&self, addr: impl AsRef<[u8]>) -> Result<Dialer> {
        self.dial_inner(addr, None)
    }

    /// Dial `addr`. With `block` the first failure is returned and the
    /// dialer discarded; without it failures are retried in the background.
    pub fn dial_with(&self, addr: impl AsRef<[u8]>, block: bool) -> Result<Dialer> {
        self.dial_inner(addr, Some(block))
    }

    /// Async twin of [`dial`](Self::dial).
    ///
    /// Connection attempts on the in-memory engine complete without
    /// suspending, so this never yields.
    pub async fn dial_async(&self, addr: impl AsRef<[u8]>) -> Result<Dialer> {
        self.dial_inner(addr, None)
    }

    fn dial_inner(&self, addr: impl AsRef<[u8]>, block: Option<bool>) -> Result<Dialer> {
        let endpoint = parse_address(addr)?;
        let id = self.core.dial(endpoint.clone(), block)?;
        Ok(Dialer::new(Arc::clone(&self.core), id, endpoint))
    }

    /// Listen on `addr`.
    pub fn listen(&self, addr: impl AsRef<[u8]>) -> Result<Listener> {
        let endpoint = parse_address(addr)?;
        let id = self.core.listen(endpoint.clone())?;
        Ok(Listener::new(Arc::clone(&self.core), id, endpoint))
    }

    /// Open a context with its own protocol state.
    pub fn new_context(&self) -> Result<Context> {
        let id = self.core.open_context()?;
        Ok(Context::new(Arc::clone(&self.core), id))
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Live pipes, oldest first.
    pub fn pipes(&self) -> Vec<Pipe> {
        self.core
            .pipes()
            .into_iter()
            .map(|info| Pipe::new(Arc::clone(&self.core), info))
            .collect()
    }

    pub fn dialers(&self) -> Vec<Dialer> {
        self.core
            .dialers()
            .into_iter()
            .map(|(id, endpoint)| Dialer::new(Arc::clone(&self.core), id, endpoint))
            .collect()
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.core
            .listeners()
            .into_iter()
            .map(|(id, endpoint)| Listener::new(Arc::clone(&self.core), id, endpoint))
            .collect()
    }

    /// Block until at least `count` pipes are connected.
    pub fn wait_for_pipes(&self, count: usize, timeout: Option<Duration>) -> Result<()> {
        self.core.begin_wait_pipes(count, timeout).wait()
    }

    pub async fn wait_for_pipes_async(&self, count: usize, timeout: Option<Duration>) -> Result<()> {
        let ticket = self.core.begin_wait_pipes(count, timeout);
        ticket.wait_async().await
    }

    /// Lifecycle events from now on.
    pub fn monitor(&self) -> SocketMonitor {
        self.core.monitor()
    }

    /// Set an option by name.
    ///
    /// Unknown names and options of other protocols fail with
    /// `NotSupported`, bad values with `InvalidArgument`.
    pub fn set_option(&self, key: impl AsRef<str>, value: impl Into<OptionValue>) -> Result<()> {
        let key: OptionKey = key.as_ref().parse()?;
        self.core.set_option(key, value.into())
    }

    pub fn get_option(&self, key: impl AsRef<str>) -> Result<OptionValue> {
        let key: OptionKey = key.as_ref().parse()?;
        self.core.get_option(key)
    }

    /// Snapshot of the current options.
    pub fn options(&self) -> SocketOptions {
        self.core.options()
    }

    pub fn name(&self) -> String {
        self.core.options().name
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        self.core.set_option(OptionKey::Name, OptionValue::Str(name.into()))
    }

    /// `None` waits forever.
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.core.options().recv_timeout
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.set_option(OptionKey::RecvTimeout, OptionValue::Duration(timeout))
    }

    /// `None` waits forever.
    pub fn send_timeout(&self) -> Option<Duration> {
        self.core.options().send_timeout
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.set_option(OptionKey::SendTimeout, OptionValue::Duration(timeout))
    }

    /// Add a topic prefix (sub0 only).
    pub fn subscribe(&self, prefix: impl Into<Bytes>) -> Result<()> {
        self.core.subscribe(ContextId::IMPLICIT, prefix.into())
    }

    /// Remove a topic prefix; `InvalidArgument` if it was never added.
    pub fn unsubscribe(&self, prefix: impl AsRef<[u8]>) -> Result<()> {
        self.core.unsubscribe(ContextId::IMPLICIT, prefix.as_ref())
    }

    pub fn topics(&self) -> Result<Vec<Bytes>> {
        self.core.topics(ContextId::IMPLICIT)
    }
}

impl_conversation!(Socket);

impl Drop for Socket {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("opener", &self.opener())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoweave_core::error::ErrorKind;
    use nanoweave_core::message::Message;

    fn engine() -> Engine {
        Engine::new().unwrap()
    }

    #[test]
    fn test_address_forms() {
        let engine = engine();
        let pull = Socket::open(&engine, Protocol::Pull0, SocketOptions::default()).unwrap();
        pull.listen("tcp://127.0.0.1:4100").unwrap();
        pull.listen(String::from("ipc:///tmp/nanoweave-socket")).unwrap();
        pull.listen(b"inproc://bytes".as_slice()).unwrap();
        assert_eq!(pull.listeners().len(), 3);

        let err = pull.listen("carrier-pigeon://x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInvalid);
        let err = pull.listen([0xff_u8, 0xfe].as_slice()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInvalid);
    }

    #[test]
    fn test_options_by_name() {
        let engine = engine();
        let sock = Socket::open(&engine, Protocol::Req0, SocketOptions::default()).unwrap();
        assert_eq!(sock.recv_timeout(), None);

        sock.set_option("recv_timeout", 250).unwrap();
        assert_eq!(sock.recv_timeout(), Some(Duration::from_millis(250)));
        sock.set_option("recv_timeout", -1).unwrap();
        assert_eq!(sock.recv_timeout(), None);

        let err = sock.set_option("no_such_option", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        let err = sock.set_option("send_timeout", "soon").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = sock.set_option("topics", "beep").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        sock.set_name("frontend").unwrap();
        assert_eq!(sock.name(), "frontend");
        assert_eq!(sock.get_option("name").unwrap().as_str(), Some("frontend"));
    }

    #[test]
    fn test_try_recv_is_immediate() {
        let engine = engine();
        let pull = Socket::open(&engine, Protocol::Pull0, SocketOptions::default()).unwrap();
        assert_eq!(pull.try_recv().unwrap_err(), WeaveError::TryAgain);

        let push = Socket::open(&engine, Protocol::Push0, SocketOptions::default()).unwrap();
        assert_eq!(push.try_send(Message::from("x")).unwrap_err(), WeaveError::TryAgain);
    }

    #[test]
    fn test_closed_socket_rejects_everything() {
        let engine = engine();
        let sock = Socket::open(&engine, Protocol::Pair0, SocketOptions::default()).unwrap();
        sock.close();
        sock.close();
        assert!(sock.is_closed());
        assert_eq!(sock.send("x").unwrap_err(), WeaveError::Closed);
        assert_eq!(sock.try_recv().unwrap_err(), WeaveError::Closed);
        assert_eq!(sock.listen("inproc://closed").unwrap_err(), WeaveError::Closed);
        assert_eq!(sock.dial("inproc://closed").unwrap_err(), WeaveError::Closed);
    }

    #[test]
    fn test_contexts_need_support() {
        let engine = engine();
        for protocol in [Protocol::Pair0, Protocol::Pub0, Protocol::Push0, Protocol::Pull0] {
            let sock = Socket::open(&engine, protocol, SocketOptions::default()).unwrap();
            let err = sock.new_context().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotSupported);
        }
        let raw = Socket::open(&engine, Opener::raw(Protocol::Rep0), SocketOptions::default()).unwrap();
        assert_eq!(raw.new_context().unwrap_err().kind(), ErrorKind::NotSupported);

        let rep = Socket::open(&engine, Protocol::Rep0, SocketOptions::default()).unwrap();
        assert!(rep.new_context().is_ok());
    }
}
