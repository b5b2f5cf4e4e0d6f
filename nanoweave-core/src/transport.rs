//! In-memory transport engine.
//!
//! An [`Engine`] resolves `tcp://`, `ipc://` and `inproc://` addresses
//! inside one process. Listening sockets register an [`Acceptor`] under an
//! address; dialing sockets call [`Engine::connect`], which builds a pair of
//! [`Link`] halves joined by `flume` queues and hands the remote half to the
//! acceptor.
//!
//! Each direction of a link holds at most the sender's send buffer depth
//! (see [`Link::set_send_buffer`]). A sender that finds its queue full
//! marks it stalled; the receiver then calls [`Link::notify_drained`]
//! after taking messages so the sender can resume.
//!
//! # Locking
//!
//! The engine never holds a registry guard while calling an acceptor, and
//! `Link` never calls a [`PipeHandler`] on its own. Sockets queue messages
//! with [`Link::send`] under their lock and call [`Link::notify_peer`] after
//! releasing it, so two socket locks are never held at once.
//!
//! ```
//! use nanoweave_core::endpoint::Endpoint;
//! use nanoweave_core::protocol::Protocol;
//! use nanoweave_core::transport::Engine;
//!
//! let engine = Engine::new().unwrap();
//! let addr = Endpoint::parse("inproc://nobody").unwrap();
//! let err = engine.connect(&addr, Protocol::Req0).unwrap_err();
//! assert!(err.is_connection_error());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{Result, WeaveError};
use crate::ids::{IdAllocator, ListenerId, PipeId};
use crate::message::Message;
use crate::options::DEFAULT_BUFFER;
use crate::protocol::Protocol;
use crate::timer::{Timer, TimerId};

/// Callbacks a pipe owner receives from its peer.
pub trait PipeHandler: Send + Sync {
    /// The peer queued at least one message on `pipe`.
    fn pipe_readable(&self, pipe: PipeId);

    /// The peer closed `pipe`.
    fn pipe_closed(&self, pipe: PipeId);

    /// The peer drained a full queue; `pipe` can send again.
    fn pipe_writable(&self, pipe: PipeId);
}

/// Accepts connections arriving at a bound address.
pub trait Acceptor: Send + Sync {
    /// Offer a freshly connected link. Returning false refuses it.
    fn accept(&self, listener: ListenerId, link: Link) -> bool;
}

struct Half {
    id: PipeId,
    protocol: Protocol,
    inbox_tx: Sender<Message>,
    inbox_rx: Receiver<Message>,
    /// Depth allowed by whoever sends into this inbox.
    capacity: AtomicUsize,
    /// The sender found this inbox full and waits to hear it drained.
    stalled: AtomicBool,
    owner: Mutex<Option<Weak<dyn PipeHandler>>>,
}

impl Half {
    fn new(id: PipeId, protocol: Protocol) -> Self {
        let (inbox_tx, inbox_rx) = flume::unbounded();
        Self {
            id,
            protocol,
            inbox_tx,
            inbox_rx,
            capacity: AtomicUsize::new(DEFAULT_BUFFER),
            stalled: AtomicBool::new(false),
            owner: Mutex::new(None),
        }
    }

    fn owner(&self) -> Option<Arc<dyn PipeHandler>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }
}

struct LinkShared {
    address: Endpoint,
    halves: [Half; 2],
    closed: AtomicBool,
}

/// One end of an established in-memory pipe.
///
/// Each end has its own [`PipeId`]; messages sent on one end land in the
/// other end's FIFO queue.
pub struct Link {
    shared: Arc<LinkShared>,
    side: usize,
}

impl Link {
    fn pair(ids: &IdAllocator, address: Endpoint, dialer: Protocol, listener: Protocol) -> (Self, Self) {
        let shared = Arc::new(LinkShared {
            address,
            halves: [Half::new(ids.pipe(), dialer), Half::new(ids.pipe(), listener)],
            closed: AtomicBool::new(false),
        });
        (
            Self {
                shared: Arc::clone(&shared),
                side: 0,
            },
            Self { shared, side: 1 },
        )
    }

    fn local(&self) -> &Half {
        &self.shared.halves[self.side]
    }

    fn remote(&self) -> &Half {
        &self.shared.halves[1 - self.side]
    }

    /// Id of this end.
    #[inline]
    pub fn id(&self) -> PipeId {
        self.local().id
    }

    /// Id of the other end.
    #[inline]
    pub fn peer_id(&self) -> PipeId {
        self.remote().id
    }

    /// The address the connection was made to.
    pub fn address(&self) -> &Endpoint {
        &self.shared.address
    }

    /// Protocol spoken by the other end.
    pub fn peer_protocol(&self) -> Protocol {
        self.remote().protocol
    }

    /// Register who is told about activity on this end.
    pub fn bind_owner(&self, owner: Weak<dyn PipeHandler>) {
        *self.local().owner.lock() = Some(owner);
    }

    /// Queue a message for the other end. Does not notify.
    ///
    /// Fails with `TryAgain` while the send buffer is full.
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(WeaveError::Closed);
        }
        if self.is_full() {
            return Err(WeaveError::TryAgain);
        }
        self.remote().inbox_tx.send(msg).map_err(|_| WeaveError::Closed)
    }

    /// Whether this end has a full send buffer in flight.
    pub fn is_full(&self) -> bool {
        let peer = self.remote();
        peer.inbox_rx.len() >= peer.capacity.load(Ordering::Acquire)
    }

    /// Cap the messages this end may have in flight (at least one).
    pub fn set_send_buffer(&self, depth: usize) {
        self.remote().capacity.store(depth.max(1), Ordering::Release);
    }

    /// Like [`is_full`](Self::is_full), but a full queue also asks the
    /// receiver for a [`PipeHandler::pipe_writable`] once it makes room.
    pub fn stall_if_full(&self) -> bool {
        if !self.is_full() {
            return false;
        }
        self.remote().stalled.store(true, Ordering::SeqCst);
        // The receiver may have drained between the two checks
        self.is_full()
    }

    /// Wake a sender stalled on this end's queue. Call after taking
    /// messages.
    pub fn notify_drained(&self) {
        if !self.local().stalled.swap(false, Ordering::SeqCst) {
            return;
        }
        let peer = self.remote();
        if let Some(owner) = peer.owner() {
            owner.pipe_writable(peer.id);
        }
    }

    /// Tell the other end's owner there is something to read.
    pub fn notify_peer(&self) {
        let peer = self.remote();
        if let Some(owner) = peer.owner() {
            owner.pipe_readable(peer.id);
        }
    }

    /// Take the next queued message, if any.
    pub fn try_recv(&self) -> Option<Message> {
        self.local().inbox_rx.try_recv().ok()
    }

    /// Number of messages waiting on this end.
    pub fn queued(&self) -> usize {
        self.local().inbox_rx.len()
    }

    /// Close both ends and notify the other end's owner.
    ///
    /// Returns false if the link was already closed.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!("[ENGINE] {} closed by local end", self.id());
        let peer = self.remote();
        if let Some(owner) = peer.owner() {
            owner.pipe_closed(peer.id);
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Clone for Link {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            side: self.side,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("peer", &self.peer_id())
            .field("address", &self.shared.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Clone)]
struct Registration {
    listener: ListenerId,
    protocol: Protocol,
    acceptor: Weak<dyn Acceptor>,
}

struct EngineInner {
    ids: IdAllocator,
    registry: DashMap<Endpoint, Registration>,
    timer: Timer,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.timer.shutdown();
    }
}

/// The in-memory transport engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine and start its timer thread.
    pub fn new() -> Result<Self> {
        let timer = Timer::start("nanoweave-timer")?;
        debug!("[ENGINE] started");
        Ok(Self {
            inner: Arc::new(EngineInner {
                ids: IdAllocator::new(),
                registry: DashMap::new(),
                timer,
            }),
        })
    }

    /// Id allocator shared by every object of this engine.
    #[inline]
    pub fn ids(&self) -> &IdAllocator {
        &self.inner.ids
    }

    /// Run `task` on the timer thread after `after`.
    pub fn schedule<F>(&self, after: Duration, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.timer.schedule(after, task)
    }

    /// Cancel a scheduled task.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.timer.cancel(id)
    }

    /// Register `acceptor` under `endpoint`.
    ///
    /// Fails with `AddressInUse` while a live acceptor holds the address.
    pub fn bind(
        &self,
        endpoint: &Endpoint,
        listener: ListenerId,
        protocol: Protocol,
        acceptor: Weak<dyn Acceptor>,
    ) -> Result<()> {
        let registration = Registration {
            listener,
            protocol,
            acceptor,
        };
        match self.inner.registry.entry(endpoint.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().acceptor.strong_count() > 0 {
                    return Err(WeaveError::AddressInUse(endpoint.to_string()));
                }
                // Owner went away without unbinding
                slot.insert(registration);
            }
            Entry::Vacant(slot) => {
                slot.insert(registration);
            }
        }
        debug!("[ENGINE] {} bound to {} ({})", listener, endpoint, protocol);
        Ok(())
    }

    /// Release `endpoint` if `listener` still holds it.
    pub fn unbind(&self, endpoint: &Endpoint, listener: ListenerId) -> bool {
        let removed = self
            .inner
            .registry
            .remove_if(endpoint, |_, reg| reg.listener == listener)
            .is_some();
        if removed {
            debug!("[ENGINE] {} released {}", listener, endpoint);
        }
        removed
    }

    /// Whether a live acceptor is bound to `endpoint`.
    pub fn is_bound(&self, endpoint: &Endpoint) -> bool {
        self.inner
            .registry
            .get(endpoint)
            .is_some_and(|reg| reg.acceptor.strong_count() > 0)
    }

    /// Addresses currently bound on this engine.
    pub fn bound_endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .registry
            .iter()
            .filter(|entry| entry.value().acceptor.strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Connect to `endpoint` speaking `protocol`.
    ///
    /// Returns the local end; the remote end has already been handed to the
    /// listening side. Fails with `ConnectionRefused` when nobody listens or
    /// the listener refuses, `InvalidProtocol` for an incompatible peer.
    pub fn connect(&self, endpoint: &Endpoint, protocol: Protocol) -> Result<Link> {
        // Clone out so no shard guard is held across accept()
        let registration = self.inner.registry.get(endpoint).map(|reg| reg.clone());
        let Some(registration) = registration else {
            return Err(WeaveError::refused(endpoint.to_string()));
        };
        let Some(acceptor) = registration.acceptor.upgrade() else {
            return Err(WeaveError::refused(endpoint.to_string()));
        };
        if !protocol.is_compatible(registration.protocol) {
            return Err(WeaveError::invalid_protocol(format!(
                "{} cannot connect to {} at {}",
                protocol, registration.protocol, endpoint
            )));
        }

        let (local, remote) = Link::pair(&self.inner.ids, endpoint.clone(), protocol, registration.protocol);
        if !acceptor.accept(registration.listener, remote) {
            local.shared.closed.store(true, Ordering::Release);
            debug!("[ENGINE] {} refused connection at {}", registration.listener, endpoint);
            return Err(WeaveError::refused(format!("{endpoint}: peer refused connection")));
        }
        trace!(
            "[ENGINE] connected {} -> {} at {}",
            local.id(),
            local.peer_id(),
            endpoint
        );
        Ok(local)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("bound", &self.inner.registry.len())
            .field("timer", &self.inner.timer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Keeps accepted links so the test can inspect them.
    #[derive(Default)]
    struct Collect {
        links: Mutex<Vec<Link>>,
        refuse: bool,
    }

    impl Acceptor for Collect {
        fn accept(&self, _listener: ListenerId, link: Link) -> bool {
            if self.refuse {
                return false;
            }
            self.links.lock().push(link);
            true
        }
    }

    #[derive(Default)]
    struct Events {
        readable: Mutex<Vec<PipeId>>,
        closed: Mutex<Vec<PipeId>>,
        writable: Mutex<Vec<PipeId>>,
    }

    impl PipeHandler for Events {
        fn pipe_readable(&self, pipe: PipeId) {
            self.readable.lock().push(pipe);
        }

        fn pipe_closed(&self, pipe: PipeId) {
            self.closed.lock().push(pipe);
        }

        fn pipe_writable(&self, pipe: PipeId) {
            self.writable.lock().push(pipe);
        }
    }

    fn addr(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    fn bind_collect(engine: &Engine, at: &Endpoint, protocol: Protocol) -> Arc<Collect> {
        let acceptor = Arc::new(Collect::default());
        let weak: Weak<dyn Acceptor> = Arc::downgrade(&acceptor) as Weak<dyn Acceptor>;
        engine
            .bind(at, engine.ids().listener(), protocol, weak)
            .unwrap();
        acceptor
    }

    #[test]
    fn test_connect_and_exchange() {
        let engine = Engine::new().unwrap();
        let at = addr("tcp://127.0.0.1:5555");
        let acceptor = bind_collect(&engine, &at, Protocol::Rep0);

        let local = engine.connect(&at, Protocol::Req0).unwrap();
        let remote = acceptor.links.lock()[0].clone();
        assert_eq!(local.peer_id(), remote.id());
        assert_eq!(remote.peer_protocol(), Protocol::Req0);

        let events = Arc::new(Events::default());
        let owner: Weak<dyn PipeHandler> = Arc::downgrade(&events) as Weak<dyn PipeHandler>;
        remote.bind_owner(owner);

        local.send(Message::from("ping")).unwrap();
        local.notify_peer();
        assert_eq!(events.readable.lock().as_slice(), &[remote.id()]);
        assert_eq!(remote.try_recv().unwrap().as_bytes(), b"ping");
        assert!(remote.try_recv().is_none());
    }

    #[test]
    fn test_send_buffer_bounds_queue() {
        let engine = Engine::new().unwrap();
        let at = addr("inproc://bounded");
        let acceptor = bind_collect(&engine, &at, Protocol::Pull0);
        let local = engine.connect(&at, Protocol::Push0).unwrap();
        let remote = acceptor.links.lock()[0].clone();

        let events = Arc::new(Events::default());
        local.bind_owner(Arc::downgrade(&events) as Weak<dyn PipeHandler>);
        local.set_send_buffer(2);

        local.send(Message::from("one")).unwrap();
        assert!(!local.is_full());
        remote.notify_drained();
        assert!(events.writable.lock().is_empty());

        local.send(Message::from("two")).unwrap();
        assert!(local.stall_if_full());
        assert_eq!(local.send(Message::from("three")).unwrap_err(), WeaveError::TryAgain);
        assert_eq!(remote.queued(), 2);

        assert_eq!(remote.try_recv().unwrap().as_bytes(), b"one");
        assert!(!local.is_full());
        remote.notify_drained();
        remote.notify_drained();
        assert_eq!(events.writable.lock().as_slice(), &[local.id()]);
    }

    #[test]
    fn test_close_notifies_peer_once() {
        let engine = Engine::new().unwrap();
        let at = addr("inproc://close");
        let acceptor = bind_collect(&engine, &at, Protocol::Pull0);
        let local = engine.connect(&at, Protocol::Push0).unwrap();
        let remote = acceptor.links.lock()[0].clone();

        let events = Arc::new(Events::default());
        remote.bind_owner(Arc::downgrade(&events) as Weak<dyn PipeHandler>);

        assert!(local.close());
        assert!(!local.close());
        assert!(remote.is_closed());
        assert_eq!(events.closed.lock().len(), 1);
        assert_eq!(local.send(Message::from("late")).unwrap_err(), WeaveError::Closed);
    }

    #[test]
    fn test_bind_conflicts_and_release() {
        let engine = Engine::new().unwrap();
        let at = addr("tcp://127.0.0.1:5556");
        let listener = engine.ids().listener();
        let acceptor: Arc<dyn Acceptor> = Arc::new(Collect::default());

        engine
            .bind(&at, listener, Protocol::Pub0, Arc::downgrade(&acceptor))
            .unwrap();
        let err = engine
            .bind(&at, engine.ids().listener(), Protocol::Pub0, Arc::downgrade(&acceptor))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInUse);
        assert_eq!(engine.bound_endpoints(), vec![at.clone()]);

        assert!(engine.unbind(&at, listener));
        assert!(!engine.is_bound(&at));
        engine
            .bind(&at, engine.ids().listener(), Protocol::Pub0, Arc::downgrade(&acceptor))
            .unwrap();
    }

    #[test]
    fn test_dead_acceptor_frees_address() {
        let engine = Engine::new().unwrap();
        let at = addr("ipc:///tmp/nanoweave-dead");
        drop(bind_collect(&engine, &at, Protocol::Pair0));

        assert!(!engine.is_bound(&at));
        let err = engine.connect(&at, Protocol::Pair0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        let _again = bind_collect(&engine, &at, Protocol::Pair0);
    }

    #[test]
    fn test_incompatible_and_refused() {
        let engine = Engine::new().unwrap();
        let at = addr("inproc://compat");
        let _acceptor = bind_collect(&engine, &at, Protocol::Rep0);

        let err = engine.connect(&at, Protocol::Push0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProtocol);

        let refusing = Arc::new(Collect {
            refuse: true,
            ..Collect::default()
        });
        let other = addr("inproc://refuse");
        engine
            .bind(
                &other,
                engine.ids().listener(),
                Protocol::Pair0,
                Arc::downgrade(&refusing) as Weak<dyn Acceptor>,
            )
            .unwrap();
        let err = engine.connect(&other, Protocol::Pair0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }
}
