//! One-shot socket construction.

use std::time::Duration;

use bytes::Bytes;
use nanoweave_core::error::Result;
use nanoweave_core::options::{OptionValue, SocketOptions};
use nanoweave_core::protocol::Opener;
use nanoweave_core::transport::Engine;

use crate::socket::Socket;

/// Collects options, listen and dial addresses, then opens the socket.
///
/// Options are applied first, then every listener is started, then every
/// dialer. The first failure closes the half-built socket and is returned.
///
/// ```
/// use nanoweave_core::protocol::Protocol;
/// use nanoweave_core::transport::Engine;
/// use nanoweave_proto::Socket;
///
/// let engine = Engine::new().unwrap();
/// let pull = Socket::builder(&engine, Protocol::Pull0)
///     .listen("inproc://builder-doc")
///     .option("recv_timeout", 500)
///     .open()
///     .unwrap();
/// let push = Socket::builder(&engine, Protocol::Push0)
///     .dial("inproc://builder-doc")
///     .open()
///     .unwrap();
/// push.send("hi").unwrap();
/// assert_eq!(pull.recv().unwrap().as_bytes(), b"hi");
/// ```
#[must_use = "a builder does nothing until `open` is called"]
#[derive(Debug)]
pub struct SocketBuilder {
    engine: Engine,
    opener: Opener,
    options: SocketOptions,
    keyed: Vec<(String, OptionValue)>,
    listen: Vec<Vec<u8>>,
    dial: Vec<Vec<u8>>,
}

impl SocketBuilder {
    pub(crate) fn new(engine: &Engine, opener: Opener) -> Self {
        Self {
            engine: engine.clone(),
            opener,
            options: SocketOptions::default(),
            keyed: Vec::new(),
            listen: Vec::new(),
            dial: Vec::new(),
        }
    }

    /// Replace the typed option set.
    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Set an option by name; applied after the typed set.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.keyed.push((key.into(), value.into()));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options = self.options.with_name(name);
        self
    }

    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_recv_timeout(timeout);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_send_timeout(timeout);
        self
    }

    /// Receive buffer depth, in messages.
    pub fn recv_buffer(mut self, depth: usize) -> Self {
        self.options = self.options.with_recv_buffer(depth);
        self
    }

    /// Send buffer depth per pipe, in messages.
    pub fn send_buffer(mut self, depth: usize) -> Self {
        self.options = self.options.with_send_buffer(depth);
        self
    }

    /// Initial subscriptions (sub0 only).
    pub fn topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.options = self.options.with_topics(topics);
        self
    }

    pub fn listen(mut self, addr: impl AsRef<[u8]>) -> Self {
        self.listen.push(addr.as_ref().to_vec());
        self
    }

    pub fn dial(mut self, addr: impl AsRef<[u8]>) -> Self {
        self.dial.push(addr.as_ref().to_vec());
        self
    }

    pub fn open(self) -> Result<Socket> {
        let socket = Socket::open(&self.engine, self.opener, self.options)?;
        for (key, value) in self.keyed {
            socket.set_option(key, value)?;
        }
        for addr in &self.listen {
            socket.listen(addr)?;
        }
        for addr in &self.dial {
            socket.dial(addr)?;
        }
        Ok(socket)
    }
}
