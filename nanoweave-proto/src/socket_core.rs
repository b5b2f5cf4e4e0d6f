//! Socket core: one protocol state machine plus everything around it.
//!
//! A [`SocketCore`] owns the socket's dialers, listeners, pipes, contexts,
//! options and blocked operations behind a single mutex. Every entry point
//! follows the same shape:
//!
//! 1. lock the state
//! 2. run a protocol transition, collecting [`Effects`]
//! 3. settle: apply effects and re-poll waiters until nothing moves
//! 4. unlock, then flush the [`Outbox`] (peer notifications, link closes)
//!
//! Inbound messages move from a pipe into the protocol only while the
//! protocol has room in its receive buffer. What stays behind on the pipe
//! is picked up once receivers make room, and until then the peer's send
//! buffer fills and its sends stall.
//!
//! Step 4 is what keeps two socket locks from ever being held together:
//! notifying a peer runs the peer's [`PipeHandler`] callbacks, which take
//! the peer's lock. The engine timer calls back into the core through weak
//! references only, outside the timer lock.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use flume::Sender;
use hashbrown::{HashMap, HashSet};
use nanoweave_core::endpoint::Endpoint;
use nanoweave_core::error::{ErrorKind, Result, WeaveError};
use nanoweave_core::ids::{ContextId, DialerId, ListenerId, PipeId, SocketId};
use nanoweave_core::message::Message;
use nanoweave_core::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use nanoweave_core::options::{OptionKey, OptionValue, SocketOptions};
use nanoweave_core::protocol::{Opener, Protocol};
use nanoweave_core::reconnect::ReconnectState;
use nanoweave_core::timer::TimerId;
use nanoweave_core::transport::{Acceptor, Engine, Link, PipeHandler};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::protocol::{Effect, Effects, Pattern, ProtocolState, RecvScope, SendOutcome, TimerKind, TimerToken};
use crate::waiter::{Mode, Pending, Ticket};

/// How a pipe came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOrigin {
    Dialer(DialerId),
    Listener(ListenerId),
}

/// Snapshot of one live pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    pub id: PipeId,
    pub address: Endpoint,
    pub peer: Protocol,
    pub origin: PipeOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialMode {
    /// Report the first failure to the caller.
    Block,
    /// Never report; keep retrying.
    Background,
    /// Report everything except "nobody listening yet", which is retried.
    Auto,
}

impl DialMode {
    const fn resolve(block: Option<bool>) -> Self {
        match block {
            Some(true) => Self::Block,
            Some(false) => Self::Background,
            None => Self::Auto,
        }
    }
}

struct DialerEntry {
    id: DialerId,
    endpoint: Endpoint,
    reconnect: ReconnectState,
    retry: Option<TimerId>,
    pipe: Option<PipeId>,
}

struct ListenerEntry {
    id: ListenerId,
    endpoint: Endpoint,
}

struct PipeEntry {
    link: Link,
    origin: PipeOrigin,
}

struct RecvWaiter {
    key: u64,
    scope: RecvScope,
    tx: Sender<Result<Message>>,
    timer: Option<TimerId>,
}

struct SendWaiter {
    key: u64,
    ctx: ContextId,
    msg: Option<Message>,
    tx: Sender<Result<()>>,
    timer: Option<TimerId>,
}

struct PipeWatcher {
    key: u64,
    min: usize,
    tx: Sender<Result<()>>,
    timer: Option<TimerId>,
}

enum Waiter {
    Recv(RecvWaiter),
    Send(SendWaiter),
    Pipes(PipeWatcher),
}

impl Waiter {
    fn timer(&self) -> Option<TimerId> {
        match self {
            Self::Recv(w) => w.timer,
            Self::Send(w) => w.timer,
            Self::Pipes(w) => w.timer,
        }
    }

    fn fail(self, error: WeaveError) {
        // A disconnected receiver means the caller stopped waiting
        match self {
            Self::Recv(w) => {
                let _ = w.tx.send(Err(error));
            }
            Self::Send(w) => {
                let _ = w.tx.send(Err(error));
            }
            Self::Pipes(w) => {
                let _ = w.tx.send(Err(error));
            }
        }
    }
}

/// Work that must happen after the socket lock is released.
#[derive(Default)]
struct Outbox {
    notify: Vec<Link>,
    drained: Vec<Link>,
    close: Vec<Link>,
}

impl Outbox {
    fn notify(&mut self, link: &Link) {
        if !self.notify.iter().any(|l| l.id() == link.id()) {
            self.notify.push(link.clone());
        }
    }

    fn drained(&mut self, link: &Link) {
        if !self.drained.iter().any(|l| l.id() == link.id()) {
            self.drained.push(link.clone());
        }
    }

    fn close(&mut self, link: Link) {
        self.close.push(link);
    }

    fn flush(self) {
        // Queued messages are announced before the pipe goes away
        for link in self.notify {
            link.notify_peer();
        }
        for link in self.drained {
            link.notify_drained();
        }
        for link in self.close {
            link.close();
        }
    }
}

struct SocketState {
    closed: bool,
    /// Set by the first dial or listen.
    started: bool,
    options: SocketOptions,
    proto: ProtocolState,
    dialers: Vec<DialerEntry>,
    listeners: Vec<ListenerEntry>,
    pipes: BTreeMap<PipeId, PipeEntry>,
    /// Pipes holding messages the protocol had no room for.
    backlog: Vec<PipeId>,
    contexts: HashSet<ContextId>,
    recv_waiters: VecDeque<RecvWaiter>,
    send_waiters: VecDeque<SendWaiter>,
    pipe_watchers: Vec<PipeWatcher>,
    monitors: Vec<SocketEventSender>,
    /// Armed protocol timers with the generation they were armed at.
    proto_timers: HashMap<(ContextId, TimerKind), (TimerId, u64)>,
    timer_generation: u64,
    next_key: u64,
}

impl SocketState {
    fn new(proto: ProtocolState, options: SocketOptions) -> Self {
        Self {
            closed: false,
            started: false,
            options,
            proto,
            dialers: Vec::new(),
            listeners: Vec::new(),
            pipes: BTreeMap::new(),
            backlog: Vec::new(),
            contexts: HashSet::new(),
            recv_waiters: VecDeque::new(),
            send_waiters: VecDeque::new(),
            pipe_watchers: Vec::new(),
            monitors: Vec::new(),
            proto_timers: HashMap::new(),
            timer_generation: 0,
            next_key: 0,
        }
    }

    fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn check_scope(&self, ctx: ContextId) -> Result<()> {
        if self.closed || (ctx != ContextId::IMPLICIT && !self.contexts.contains(&ctx)) {
            return Err(WeaveError::Closed);
        }
        Ok(())
    }

    fn dialer(&self, id: DialerId) -> Option<&DialerEntry> {
        self.dialers.iter().find(|d| d.id == id)
    }

    fn dialer_mut(&mut self, id: DialerId) -> Option<&mut DialerEntry> {
        self.dialers.iter_mut().find(|d| d.id == id)
    }

    fn emit(&mut self, event: SocketEvent) {
        self.monitors.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn remove_waiter(&mut self, key: u64) -> Option<Waiter> {
        if let Some(pos) = self.recv_waiters.iter().position(|w| w.key == key) {
            return self.recv_waiters.remove(pos).map(Waiter::Recv);
        }
        if let Some(pos) = self.send_waiters.iter().position(|w| w.key == key) {
            return self.send_waiters.remove(pos).map(Waiter::Send);
        }
        let pos = self.pipe_watchers.iter().position(|w| w.key == key)?;
        Some(Waiter::Pipes(self.pipe_watchers.remove(pos)))
    }
}

/// Shared state of one socket. Handles (`Socket`, `Context`, `Dialer`,
/// `Listener`, `Pipe`) all point at the same core.
pub struct SocketCore {
    id: SocketId,
    opener: Opener,
    engine: Engine,
    me: Weak<SocketCore>,
    state: Mutex<SocketState>,
}

impl SocketCore {
    /// Build a socket for `opener` on `engine`.
    pub fn open(engine: &Engine, opener: Opener, mut options: SocketOptions) -> Result<Arc<Self>> {
        let id = engine.ids().socket();
        if options.name.is_empty() {
            options.name = id.get().to_string();
        }
        let protocol = opener.protocol();
        if !options.topics.is_empty() && (opener.is_raw() || !OptionKey::Topics.applies_to(protocol)) {
            return Err(WeaveError::not_supported(format!("topics do not apply to {opener}")));
        }
        if options.polyamorous && !OptionKey::Polyamorous.applies_to(protocol) {
            return Err(WeaveError::not_supported(format!("polyamorous does not apply to {opener}")));
        }
        let mut proto = ProtocolState::new(opener, &options);
        if !options.topics.is_empty() {
            proto.replace_topics(ContextId::IMPLICIT, &options.topics)?;
        }
        debug!("[SOCKET] {} opened as {} ({:?})", id, opener, options.name);
        Ok(Arc::new_cyclic(|me| Self {
            id,
            opener,
            engine: engine.clone(),
            me: me.clone(),
            state: Mutex::new(SocketState::new(proto, options)),
        }))
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    pub fn opener(&self) -> Opener {
        self.opener
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.opener.protocol()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Lock, run `f`, settle, unlock, then flush deferred work.
    fn with_state<R>(&self, f: impl FnOnce(&mut SocketState, &mut Effects, &mut Outbox) -> R) -> R {
        let mut fx = Effects::new();
        let mut out = Outbox::default();
        let result = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let result = f(st, &mut fx, &mut out);
            self.settle(st, &mut fx, &mut out);
            result
        };
        out.flush();
        result
    }

    // ---- waiters -------------------------------------------------------

    /// Start a receive on `scope`.
    pub fn begin_recv(&self, scope: RecvScope, mode: Mode) -> Ticket<Message> {
        self.with_state(|st, fx, _| {
            if let Err(e) = st.check_scope(scope.ctx) {
                return Ticket::Done(Err(e));
            }
            match st.proto.recv(scope, fx) {
                Err(e) => Ticket::Done(Err(e)),
                Ok(Poll::Ready(msg)) => Ticket::Done(Ok(msg)),
                Ok(Poll::Pending) => {
                    if mode == Mode::Poll {
                        return Ticket::Done(Err(WeaveError::TryAgain));
                    }
                    let timeout = st.options.recv_timeout;
                    if timeout == Some(Duration::ZERO) {
                        return Ticket::Done(Err(WeaveError::Timeout));
                    }
                    let key = st.next_key();
                    let (tx, rx) = flume::bounded(1);
                    let timer = timeout.map(|after| self.arm_deadline(key, after));
                    st.recv_waiters.push_back(RecvWaiter { key, scope, tx, timer });
                    let pending = Pending::new(rx, key, self.me.clone())
                        .on_unclaimed(move |core: &SocketCore, msg| core.requeue(scope, msg));
                    Ticket::Waiting(pending)
                }
            }
        })
    }

    /// Start a send on `ctx`. Sends queued behind earlier blocked sends of
    /// the same context keep their order.
    pub fn begin_send(&self, ctx: ContextId, msg: Message, mode: Mode) -> Ticket<()> {
        self.with_state(|st, fx, _| {
            if let Err(e) = st.check_scope(ctx) {
                return Ticket::Done(Err(e));
            }
            let queued = st.send_waiters.iter().any(|w| w.ctx == ctx);
            let msg = if queued {
                msg
            } else {
                match st.proto.send(ctx, msg, fx) {
                    Err(e) => return Ticket::Done(Err(e)),
                    Ok(SendOutcome::Sent) => return Ticket::Done(Ok(())),
                    Ok(SendOutcome::Blocked(msg)) => msg,
                }
            };
            if mode == Mode::Poll {
                return Ticket::Done(Err(WeaveError::TryAgain));
            }
            let timeout = st.options.send_timeout;
            if timeout == Some(Duration::ZERO) {
                return Ticket::Done(Err(WeaveError::Timeout));
            }
            let key = st.next_key();
            let (tx, rx) = flume::bounded(1);
            let timer = timeout.map(|after| self.arm_deadline(key, after));
            st.send_waiters.push_back(SendWaiter {
                key,
                ctx,
                msg: Some(msg),
                tx,
                timer,
            });
            Ticket::Waiting(Pending::new(rx, key, self.me.clone()))
        })
    }

    /// Wait until at least `min` pipes are connected.
    pub fn begin_wait_pipes(&self, min: usize, timeout: Option<Duration>) -> Ticket<()> {
        self.with_state(|st, _, _| {
            if st.closed {
                return Ticket::Done(Err(WeaveError::Closed));
            }
            if st.pipes.len() >= min {
                return Ticket::Done(Ok(()));
            }
            if timeout == Some(Duration::ZERO) {
                return Ticket::Done(Err(WeaveError::Timeout));
            }
            let key = st.next_key();
            let (tx, rx) = flume::bounded(1);
            let timer = timeout.map(|after| self.arm_deadline(key, after));
            st.pipe_watchers.push(PipeWatcher { key, min, tx, timer });
            Ticket::Waiting(Pending::new(rx, key, self.me.clone()))
        })
    }

    fn arm_deadline(&self, key: u64, after: Duration) -> TimerId {
        let core = self.me.clone();
        self.engine.schedule(after, move || {
            if let Some(core) = core.upgrade() {
                core.expire_waiter(key);
            }
        })
    }

    fn expire_waiter(&self, key: u64) {
        self.with_state(|st, _, _| {
            if let Some(waiter) = st.remove_waiter(key) {
                trace!("[TIMER] {} waiter {} timed out", self.id, key);
                waiter.fail(WeaveError::Timeout);
            }
        });
    }

    /// Deregister a waiter whose caller went away.
    pub(crate) fn cancel_waiter(&self, key: u64) {
        self.with_state(|st, _, _| {
            if let Some(waiter) = st.remove_waiter(key) {
                self.cancel_timer(waiter.timer());
            }
        });
    }

    /// Hand back a message that completed a receive nobody collected.
    pub(crate) fn requeue(&self, scope: RecvScope, msg: Message) {
        self.with_state(|st, _, _| {
            if st.check_scope(scope.ctx).is_err() {
                trace!("[SOCKET] {} returned message dropped, {} is gone", self.id, scope.ctx);
                return;
            }
            trace!("[SOCKET] {} message returned to {}", self.id, scope.ctx);
            st.proto.unrecv(scope, msg);
        });
    }

    fn cancel_timer(&self, timer: Option<TimerId>) {
        if let Some(timer) = timer {
            self.engine.cancel(timer);
        }
    }

    fn fail_recv(&self, st: &mut SocketState, selected: impl Fn(&RecvScope) -> bool, error: &WeaveError) {
        let (failed, kept): (VecDeque<_>, VecDeque<_>) =
            st.recv_waiters.drain(..).partition(|w| selected(&w.scope));
        st.recv_waiters = kept;
        for waiter in failed {
            self.cancel_timer(waiter.timer);
            Waiter::Recv(waiter).fail(error.clone());
        }
    }

    fn fail_send(&self, st: &mut SocketState, selected: impl Fn(ContextId) -> bool, error: &WeaveError) {
        let (failed, kept): (VecDeque<_>, VecDeque<_>) =
            st.send_waiters.drain(..).partition(|w| selected(w.ctx));
        st.send_waiters = kept;
        for waiter in failed {
            self.cancel_timer(waiter.timer);
            Waiter::Send(waiter).fail(error.clone());
        }
    }

    // ---- settling ------------------------------------------------------

    fn settle(&self, st: &mut SocketState, fx: &mut Effects, out: &mut Outbox) {
        loop {
            while let Some(effect) = fx.pop() {
                self.apply(st, effect, fx, out);
            }
            let received = self.service_recv(st, fx);
            let sent = self.service_send(st, fx, out);
            let refilled = self.service_backlog(st, fx, out);
            if !received && !sent && !refilled && fx.is_empty() {
                break;
            }
        }
        self.service_watchers(st);
    }

    fn apply(&self, st: &mut SocketState, effect: Effect, fx: &mut Effects, out: &mut Outbox) {
        match effect {
            Effect::Transmit { pipe, msg } => {
                let Some(link) = st.pipes.get(&pipe).map(|e| e.link.clone()) else {
                    trace!("[SOCKET] {} no such pipe {}, message dropped", self.id, pipe);
                    return;
                };
                match link.send(msg) {
                    Ok(()) => out.notify(&link),
                    Err(e) => trace!("[SOCKET] {} send on {} failed: {}", self.id, pipe, e),
                }
                if link.stall_if_full() {
                    trace!("[SOCKET] {} send buffer of {} full", self.id, pipe);
                    st.proto.set_writable(pipe, false, fx);
                }
            }
            Effect::Schedule { after, token } => self.arm_protocol_timer(st, after, token),
            Effect::Cancel { ctx, kind } => {
                if let Some((timer, _)) = st.proto_timers.remove(&(ctx, kind)) {
                    self.engine.cancel(timer);
                }
            }
            Effect::FailRecv { ctx, error } => self.fail_recv(st, |scope| scope.ctx == ctx, &error),
            Effect::ClosePipe(pipe) => {
                if let Some(entry) = self.drop_pipe(st, pipe, fx) {
                    out.close(entry.link);
                }
            }
        }
    }

    fn service_recv(&self, st: &mut SocketState, fx: &mut Effects) -> bool {
        if st.recv_waiters.is_empty() {
            return false;
        }
        let mut progressed = false;
        for waiter in std::mem::take(&mut st.recv_waiters) {
            if waiter.tx.is_disconnected() {
                self.cancel_timer(waiter.timer);
                continue;
            }
            let result = match st.proto.recv(waiter.scope, fx) {
                Ok(Poll::Pending) => {
                    st.recv_waiters.push_back(waiter);
                    continue;
                }
                Ok(Poll::Ready(msg)) => Ok(msg),
                Err(e) => Err(e),
            };
            progressed = true;
            self.cancel_timer(waiter.timer);
            if waiter.tx.send(result).is_err() {
                warn!("[SOCKET] {} receiver vanished, result dropped", self.id);
            }
        }
        progressed
    }

    /// Blocked sends in order. Effects of each send are applied before the
    /// next so pipes that fill up are passed over.
    fn service_send(&self, st: &mut SocketState, fx: &mut Effects, out: &mut Outbox) -> bool {
        if st.send_waiters.is_empty() {
            return false;
        }
        let mut progressed = false;
        let mut blocked: Vec<ContextId> = Vec::new();
        for mut waiter in std::mem::take(&mut st.send_waiters) {
            if waiter.tx.is_disconnected() {
                self.cancel_timer(waiter.timer);
                continue;
            }
            let Some(msg) = waiter.msg.take() else {
                continue;
            };
            if blocked.contains(&waiter.ctx) {
                waiter.msg = Some(msg);
                st.send_waiters.push_back(waiter);
                continue;
            }
            let result = st.proto.send(waiter.ctx, msg, fx);
            while let Some(effect) = fx.pop() {
                self.apply(st, effect, fx, out);
            }
            let result = match result {
                Ok(SendOutcome::Blocked(msg)) => {
                    waiter.msg = Some(msg);
                    blocked.push(waiter.ctx);
                    st.send_waiters.push_back(waiter);
                    continue;
                }
                Ok(SendOutcome::Sent) => Ok(()),
                Err(e) => Err(e),
            };
            progressed = true;
            self.cancel_timer(waiter.timer);
            let _ = waiter.tx.send(result);
        }
        progressed
    }

    /// Move messages left on pipes into the protocol once it has room.
    fn service_backlog(&self, st: &mut SocketState, fx: &mut Effects, out: &mut Outbox) -> bool {
        if st.backlog.is_empty() || !st.proto.can_accept() {
            return false;
        }
        let mut progressed = false;
        for pipe in std::mem::take(&mut st.backlog) {
            let Some(link) = st.pipes.get(&pipe).map(|e| e.link.clone()) else {
                continue;
            };
            let before = link.queued();
            Self::drain(st, &link, fx, out);
            progressed |= link.queued() < before;
        }
        progressed
    }

    fn service_watchers(&self, st: &mut SocketState) {
        if st.pipe_watchers.is_empty() {
            return;
        }
        let count = st.pipes.len();
        let (ready, waiting): (Vec<_>, Vec<_>) = st.pipe_watchers.drain(..).partition(|w| count >= w.min);
        st.pipe_watchers = waiting;
        for watcher in ready {
            self.cancel_timer(watcher.timer);
            let _ = watcher.tx.send(Ok(()));
        }
    }

    fn arm_protocol_timer(&self, st: &mut SocketState, after: Duration, token: TimerToken) {
        st.timer_generation += 1;
        let generation = st.timer_generation;
        let core = self.me.clone();
        let timer = self.engine.schedule(after, move || {
            if let Some(core) = core.upgrade() {
                core.protocol_timer(token, generation);
            }
        });
        if let Some((old, _)) = st.proto_timers.insert((token.ctx, token.kind), (timer, generation)) {
            self.engine.cancel(old);
        }
    }

    fn protocol_timer(&self, token: TimerToken, generation: u64) {
        self.with_state(|st, fx, _| {
            let key = (token.ctx, token.kind);
            // Re-armed or cancelled since
            if st.closed || st.proto_timers.get(&key).map(|(_, g)| *g) != Some(generation) {
                return;
            }
            st.proto_timers.remove(&key);
            st.proto.on_timer(token, fx);
        });
    }

    // ---- pipes ---------------------------------------------------------

    /// Hand a fresh link to the protocol. False if the protocol refused it.
    fn attach_pipe(
        &self,
        st: &mut SocketState,
        link: &Link,
        origin: PipeOrigin,
        fx: &mut Effects,
        out: &mut Outbox,
    ) -> bool {
        let pipe = link.id();
        link.set_send_buffer(st.options.send_buffer);
        if !st.proto.add_pipe(pipe, fx) {
            debug!("[SOCKET] {} refused {} from {}", self.id, pipe, link.address());
            return false;
        }
        let owner: Weak<dyn PipeHandler> = self.me.clone();
        link.bind_owner(owner);
        st.pipes.insert(
            pipe,
            PipeEntry {
                link: link.clone(),
                origin,
            },
        );
        st.emit(SocketEvent::PipeAdded {
            pipe,
            endpoint: link.address().clone(),
        });
        if let PipeOrigin::Dialer(dialer) = origin {
            if let Some(dialer) = st.dialer_mut(dialer) {
                dialer.pipe = Some(pipe);
                dialer.reconnect.reset();
            }
        }
        debug!("[SOCKET] {} added {} ({})", self.id, pipe, link.address());

        // Anything the peer queued before we owned the link
        Self::drain(st, link, fx, out);
        if link.is_closed() {
            self.drop_pipe(st, pipe, fx);
        }
        true
    }

    /// Deliver queued messages while the protocol has room. A pipe left
    /// holding messages goes on the backlog.
    fn drain(st: &mut SocketState, link: &Link, fx: &mut Effects, out: &mut Outbox) {
        let pipe = link.id();
        let mut taken = false;
        while st.proto.can_accept() {
            let Some(mut msg) = link.try_recv() else {
                break;
            };
            msg.set_pipe(Some(pipe));
            st.proto.deliver(pipe, msg, fx);
            taken = true;
        }
        if taken {
            out.drained(link);
        }
        if link.queued() > 0 && !st.backlog.contains(&pipe) {
            st.backlog.push(pipe);
        }
    }

    /// Deliver everything the peer sent before it hung up.
    fn drain_closed(st: &mut SocketState, link: &Link, fx: &mut Effects) {
        let pipe = link.id();
        while let Some(mut msg) = link.try_recv() {
            msg.set_pipe(Some(pipe));
            st.proto.deliver(pipe, msg, fx);
        }
    }

    /// Forget a pipe. The caller decides whether its link is closed.
    fn drop_pipe(&self, st: &mut SocketState, pipe: PipeId, fx: &mut Effects) -> Option<PipeEntry> {
        let entry = st.pipes.remove(&pipe)?;
        st.backlog.retain(|p| *p != pipe);
        st.proto.remove_pipe(pipe, fx);
        self.fail_recv(st, |scope| scope.pipe == Some(pipe), &WeaveError::Closed);
        st.emit(SocketEvent::PipeRemoved {
            pipe,
            endpoint: entry.link.address().clone(),
        });
        debug!("[SOCKET] {} removed {}", self.id, pipe);

        if let PipeOrigin::Dialer(dialer) = entry.origin {
            let owned = match st.dialer_mut(dialer) {
                Some(d) if d.pipe == Some(pipe) => {
                    d.pipe = None;
                    true
                }
                _ => false,
            };
            if owned {
                self.schedule_redial_locked(st, dialer);
            }
        }
        Some(entry)
    }

    /// Snapshot of the live pipes, oldest first.
    pub fn pipes(&self) -> Vec<PipeInfo> {
        let st = self.state.lock();
        st.pipes
            .iter()
            .map(|(id, entry)| PipeInfo {
                id: *id,
                address: entry.link.address().clone(),
                peer: entry.link.peer_protocol(),
                origin: entry.origin,
            })
            .collect()
    }

    pub fn pipe_info(&self, pipe: PipeId) -> Option<PipeInfo> {
        let st = self.state.lock();
        st.pipes.get(&pipe).map(|entry| PipeInfo {
            id: pipe,
            address: entry.link.address().clone(),
            peer: entry.link.peer_protocol(),
            origin: entry.origin,
        })
    }

    pub fn has_pipe(&self, pipe: PipeId) -> bool {
        self.state.lock().pipes.contains_key(&pipe)
    }

    /// Close one pipe. Its dialer, if any, reconnects.
    pub fn close_pipe(&self, pipe: PipeId) -> bool {
        self.with_state(|st, fx, out| match self.drop_pipe(st, pipe, fx) {
            Some(entry) => {
                out.close(entry.link);
                true
            }
            None => false,
        })
    }

    fn check_pipe_io(&self, pipe: PipeId) -> Result<()> {
        let st = self.state.lock();
        if st.closed {
            return Err(WeaveError::Closed);
        }
        if !st.proto.supports_pipe_io() {
            return Err(WeaveError::not_supported(format!(
                "{} cannot address pipes individually",
                self.opener
            )));
        }
        if !st.pipes.contains_key(&pipe) {
            return Err(WeaveError::Closed);
        }
        Ok(())
    }

    /// Send on one pipe (polyamorous pair1 only).
    pub fn pipe_send(&self, pipe: PipeId, mut msg: Message, mode: Mode) -> Ticket<()> {
        if let Err(e) = self.check_pipe_io(pipe) {
            return Ticket::Done(Err(e));
        }
        msg.set_pipe(Some(pipe));
        self.begin_send(ContextId::IMPLICIT, msg, mode)
    }

    /// Receive from one pipe (polyamorous pair1 only).
    pub fn pipe_recv(&self, pipe: PipeId, mode: Mode) -> Ticket<Message> {
        if let Err(e) = self.check_pipe_io(pipe) {
            return Ticket::Done(Err(e));
        }
        self.begin_recv(RecvScope::pipe(pipe), mode)
    }

    // ---- dialers -------------------------------------------------------

    /// Create a dialer for `endpoint`. `block` overrides `block_on_dial`.
    pub fn dial(&self, endpoint: Endpoint, block: Option<bool>) -> Result<DialerId> {
        let (id, mode) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(WeaveError::Closed);
            }
            if st.dialers.iter().any(|d| d.endpoint == endpoint) {
                return Err(WeaveError::AddressInUse(format!("already dialing {endpoint}")));
            }
            let id = self.engine.ids().dialer();
            let reconnect = ReconnectState::new(&st.options);
            st.dialers.push(DialerEntry {
                id,
                endpoint: endpoint.clone(),
                reconnect,
                retry: None,
                pipe: None,
            });
            st.started = true;
            st.emit(SocketEvent::Dialing {
                dialer: id,
                endpoint: endpoint.clone(),
            });
            (id, DialMode::resolve(block.or(st.options.block_on_dial)))
        };
        debug!("[SOCKET] {} {} dialing {} ({:?})", self.id, id, endpoint, mode);

        match self.connect_dialer(id) {
            Ok(()) => Ok(id),
            Err(WeaveError::Closed) => Err(WeaveError::Closed),
            Err(e) if mode == DialMode::Background => {
                trace!("[SOCKET] {} {} will retry: {}", self.id, id, e);
                self.schedule_redial(id);
                Ok(id)
            }
            Err(e) if mode == DialMode::Auto && e.kind() == ErrorKind::ConnectionRefused => {
                debug!("[SOCKET] {} nobody at {} yet, dialing in background", self.id, endpoint);
                self.schedule_redial(id);
                Ok(id)
            }
            Err(e) => {
                self.close_dialer(id);
                Err(e)
            }
        }
    }

    /// One connection attempt for dialer `id`, outside the socket lock.
    fn connect_dialer(&self, id: DialerId) -> Result<()> {
        let endpoint = {
            let st = self.state.lock();
            if st.closed {
                return Err(WeaveError::Closed);
            }
            match st.dialer(id) {
                None => return Err(WeaveError::Closed),
                Some(dialer) if dialer.pipe.is_some() => return Ok(()),
                Some(dialer) => dialer.endpoint.clone(),
            }
        };

        let link = match self.engine.connect(&endpoint, self.protocol()) {
            Ok(link) => link,
            Err(e) => {
                debug!("[SOCKET] {} {} failed to connect to {}: {}", self.id, id, endpoint, e);
                self.state.lock().emit(SocketEvent::ConnectFailed {
                    dialer: id,
                    endpoint,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let attached = self.with_state(|st, fx, out| {
            if st.closed || st.dialer(id).is_none() {
                return Err(WeaveError::Closed);
            }
            Ok(self.attach_pipe(st, &link, PipeOrigin::Dialer(id), fx, out))
        });
        match attached {
            Ok(true) => Ok(()),
            Ok(false) => {
                link.close();
                Err(WeaveError::refused(format!("{endpoint}: {} takes no more peers", self.opener)))
            }
            Err(e) => {
                link.close();
                Err(e)
            }
        }
    }

    fn schedule_redial(&self, id: DialerId) {
        self.with_state(|st, _, _| self.schedule_redial_locked(st, id));
    }

    fn schedule_redial_locked(&self, st: &mut SocketState, id: DialerId) {
        if st.closed {
            return;
        }
        let Some(dialer) = st.dialer_mut(id) else {
            return;
        };
        if dialer.pipe.is_some() || dialer.retry.is_some() {
            return;
        }
        let delay = dialer.reconnect.next_delay();
        let core = self.me.clone();
        dialer.retry = Some(self.engine.schedule(delay, move || {
            if let Some(core) = core.upgrade() {
                core.redial(id);
            }
        }));
        trace!("[SOCKET] {} {} redial in {:?}", self.id, id, delay);
    }

    fn redial(&self, id: DialerId) {
        {
            let mut st = self.state.lock();
            match st.dialer_mut(id) {
                Some(dialer) => dialer.retry = None,
                None => return,
            }
        }
        match self.connect_dialer(id) {
            Ok(()) | Err(WeaveError::Closed) => {}
            Err(e) => {
                trace!("[SOCKET] {} {} redial failed: {}", self.id, id, e);
                self.schedule_redial(id);
            }
        }
    }

    /// Close a dialer and its pipe. False if it was already gone.
    pub fn close_dialer(&self, id: DialerId) -> bool {
        self.with_state(|st, fx, out| {
            let Some(pos) = st.dialers.iter().position(|d| d.id == id) else {
                return false;
            };
            let dialer = st.dialers.remove(pos);
            self.cancel_timer(dialer.retry);
            if let Some(pipe) = dialer.pipe {
                if let Some(entry) = self.drop_pipe(st, pipe, fx) {
                    out.close(entry.link);
                }
            }
            st.emit(SocketEvent::DialerClosed {
                dialer: id,
                endpoint: dialer.endpoint.clone(),
            });
            debug!("[SOCKET] {} {} closed ({})", self.id, id, dialer.endpoint);
            true
        })
    }

    pub fn dialers(&self) -> Vec<(DialerId, Endpoint)> {
        let st = self.state.lock();
        st.dialers.iter().map(|d| (d.id, d.endpoint.clone())).collect()
    }

    pub fn has_dialer(&self, id: DialerId) -> bool {
        self.state.lock().dialer(id).is_some()
    }

    // ---- listeners -----------------------------------------------------

    /// Bind `endpoint` and start accepting pipes on it.
    pub fn listen(&self, endpoint: Endpoint) -> Result<ListenerId> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(WeaveError::Closed);
        }
        if st.listeners.iter().any(|l| l.endpoint == endpoint) {
            return Err(WeaveError::AddressInUse(endpoint.to_string()));
        }
        let id = self.engine.ids().listener();
        let acceptor: Weak<dyn Acceptor> = self.me.clone();
        self.engine.bind(&endpoint, id, self.protocol(), acceptor)?;
        st.listeners.push(ListenerEntry {
            id,
            endpoint: endpoint.clone(),
        });
        st.started = true;
        st.emit(SocketEvent::Listening {
            listener: id,
            endpoint: endpoint.clone(),
        });
        debug!("[SOCKET] {} {} listening on {}", self.id, id, endpoint);
        Ok(id)
    }

    /// Release a listener's address and close the pipes it accepted.
    pub fn close_listener(&self, id: ListenerId) -> bool {
        self.with_state(|st, fx, out| {
            let Some(pos) = st.listeners.iter().position(|l| l.id == id) else {
                return false;
            };
            let listener = st.listeners.remove(pos);
            self.engine.unbind(&listener.endpoint, id);
            let accepted: Vec<PipeId> = st
                .pipes
                .iter()
                .filter(|(_, entry)| entry.origin == PipeOrigin::Listener(id))
                .map(|(pipe, _)| *pipe)
                .collect();
            for pipe in accepted {
                if let Some(entry) = self.drop_pipe(st, pipe, fx) {
                    out.close(entry.link);
                }
            }
            st.emit(SocketEvent::ListenerClosed {
                listener: id,
                endpoint: listener.endpoint.clone(),
            });
            debug!("[SOCKET] {} {} closed ({})", self.id, id, listener.endpoint);
            true
        })
    }

    pub fn listeners(&self) -> Vec<(ListenerId, Endpoint)> {
        let st = self.state.lock();
        st.listeners.iter().map(|l| (l.id, l.endpoint.clone())).collect()
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.state.lock().listeners.iter().any(|l| l.id == id)
    }

    // ---- contexts ------------------------------------------------------

    pub fn open_context(&self) -> Result<ContextId> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(WeaveError::Closed);
        }
        if self.opener.is_raw() || !self.protocol().supports_contexts() {
            return Err(WeaveError::not_supported(format!("{} has no contexts", self.opener)));
        }
        let ctx = self.engine.ids().context();
        st.proto.open_context(ctx)?;
        st.contexts.insert(ctx);
        trace!("[SOCKET] {} opened {}", self.id, ctx);
        Ok(ctx)
    }

    /// Close a context, failing its blocked operations with `Closed`.
    pub fn close_context(&self, ctx: ContextId) {
        self.with_state(|st, fx, _| {
            if !st.contexts.remove(&ctx) {
                return;
            }
            self.fail_recv(st, |scope| scope.ctx == ctx, &WeaveError::Closed);
            self.fail_send(st, |c| c == ctx, &WeaveError::Closed);
            st.proto.close_context(ctx, fx);
            let timers: Vec<_> = st.proto_timers.keys().filter(|(c, _)| *c == ctx).copied().collect();
            for key in timers {
                if let Some((timer, _)) = st.proto_timers.remove(&key) {
                    self.engine.cancel(timer);
                }
            }
            trace!("[SOCKET] {} closed {}", self.id, ctx);
        });
    }

    pub fn is_context_open(&self, ctx: ContextId) -> bool {
        let st = self.state.lock();
        !st.closed && st.contexts.contains(&ctx)
    }

    // ---- subscriptions -------------------------------------------------

    pub fn subscribe(&self, ctx: ContextId, prefix: Bytes) -> Result<()> {
        let mut st = self.state.lock();
        st.check_scope(ctx)?;
        st.proto.subscribe(ctx, prefix.clone())?;
        if ctx == ContextId::IMPLICIT && !st.options.topics.contains(&prefix) {
            st.options.topics.push(prefix);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, ctx: ContextId, prefix: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        st.check_scope(ctx)?;
        st.proto.unsubscribe(ctx, prefix)?;
        if ctx == ContextId::IMPLICIT {
            st.options.topics.retain(|t| t.as_ref() != prefix);
        }
        Ok(())
    }

    pub fn topics(&self, ctx: ContextId) -> Result<Vec<Bytes>> {
        let st = self.state.lock();
        st.check_scope(ctx)?;
        st.proto.topics(ctx)
    }

    // ---- options -------------------------------------------------------

    pub fn set_option(&self, key: OptionKey, value: OptionValue) -> Result<()> {
        self.with_state(|st, fx, _| {
            if st.closed {
                return Err(WeaveError::Closed);
            }
            if !key.applies_to(self.protocol()) {
                return Err(WeaveError::not_supported(format!("{key} does not apply to {}", self.protocol())));
            }
            if key == OptionKey::Polyamorous && st.started {
                return Err(WeaveError::bad_state("polyamorous must be set before dial or listen"));
            }
            let mut next = st.options.clone();
            next.set(key, value)?;
            if key == OptionKey::Topics {
                st.proto.replace_topics(ContextId::IMPLICIT, &next.topics)?;
            }
            st.options = next;
            st.proto.apply_options(&st.options);
            for dialer in &mut st.dialers {
                dialer.reconnect.update(&st.options);
            }
            if key == OptionKey::SendBuffer {
                for (pipe, entry) in &st.pipes {
                    entry.link.set_send_buffer(st.options.send_buffer);
                    st.proto.set_writable(*pipe, !entry.link.stall_if_full(), fx);
                }
            }
            trace!("[SOCKET] {} set {}", self.id, key);
            Ok(())
        })
    }

    pub fn get_option(&self, key: OptionKey) -> Result<OptionValue> {
        let st = self.state.lock();
        if st.closed {
            return Err(WeaveError::Closed);
        }
        if !key.applies_to(self.protocol()) {
            return Err(WeaveError::not_supported(format!("{key} does not apply to {}", self.protocol())));
        }
        Ok(st.options.get(key))
    }

    /// Copy of the current options.
    pub fn options(&self) -> SocketOptions {
        self.state.lock().options.clone()
    }

    // ---- monitor & close -----------------------------------------------

    pub fn monitor(&self) -> SocketMonitor {
        let (tx, rx) = create_monitor();
        let mut st = self.state.lock();
        if st.closed {
            let _ = tx.send(SocketEvent::Closed);
        } else {
            st.monitors.push(tx);
        }
        rx
    }

    /// Close everything. Idempotent.
    pub fn close(&self) {
        let mut out = Outbox::default();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.closed {
                return;
            }
            st.closed = true;

            self.fail_recv(st, |_| true, &WeaveError::Closed);
            self.fail_send(st, |_| true, &WeaveError::Closed);
            for watcher in std::mem::take(&mut st.pipe_watchers) {
                self.cancel_timer(watcher.timer);
                Waiter::Pipes(watcher).fail(WeaveError::Closed);
            }
            for (_, (timer, _)) in st.proto_timers.drain() {
                self.engine.cancel(timer);
            }

            for listener in std::mem::take(&mut st.listeners) {
                self.engine.unbind(&listener.endpoint, listener.id);
                st.emit(SocketEvent::ListenerClosed {
                    listener: listener.id,
                    endpoint: listener.endpoint,
                });
            }
            for dialer in std::mem::take(&mut st.dialers) {
                self.cancel_timer(dialer.retry);
                st.emit(SocketEvent::DialerClosed {
                    dialer: dialer.id,
                    endpoint: dialer.endpoint,
                });
            }
            for (pipe, entry) in std::mem::take(&mut st.pipes) {
                st.emit(SocketEvent::PipeRemoved {
                    pipe,
                    endpoint: entry.link.address().clone(),
                });
                out.close(entry.link);
            }
            st.contexts.clear();
            st.emit(SocketEvent::Closed);
            st.monitors.clear();
        }
        out.flush();
        debug!("[SOCKET] {} closed", self.id);
    }
}

impl PipeHandler for SocketCore {
    fn pipe_readable(&self, pipe: PipeId) {
        self.with_state(|st, fx, out| {
            if let Some(link) = st.pipes.get(&pipe).map(|e| e.link.clone()) {
                Self::drain(st, &link, fx, out);
            }
        });
    }

    fn pipe_closed(&self, pipe: PipeId) {
        self.with_state(|st, fx, _| {
            if let Some(link) = st.pipes.get(&pipe).map(|e| e.link.clone()) {
                // Keep what the peer sent before hanging up
                Self::drain_closed(st, &link, fx);
                debug!("[SOCKET] {} {} closed by peer", self.id, pipe);
                self.drop_pipe(st, pipe, fx);
            }
        });
    }

    fn pipe_writable(&self, pipe: PipeId) {
        self.with_state(|st, fx, _| {
            let Some(link) = st.pipes.get(&pipe).map(|e| e.link.clone()) else {
                return;
            };
            if !link.stall_if_full() {
                trace!("[SOCKET] {} {} writable again", self.id, pipe);
                st.proto.set_writable(pipe, true, fx);
            }
        });
    }
}

impl Acceptor for SocketCore {
    fn accept(&self, listener: ListenerId, link: Link) -> bool {
        self.with_state(|st, fx, out| {
            if st.closed || !st.listeners.iter().any(|l| l.id == listener) {
                return false;
            }
            self.attach_pipe(st, &link, PipeOrigin::Listener(listener), fx, out)
        })
    }
}

impl fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketCore")
            .field("id", &self.id)
            .field("opener", &self.opener)
            .field("closed", &self.is_closed())
            .finish()
    }
}
