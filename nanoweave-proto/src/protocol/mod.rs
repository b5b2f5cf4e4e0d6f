//! Per-protocol state machines.
//!
//! Every machine implements [`Pattern`]: transitions take `&mut self` plus
//! an [`Effects`] sink and never block, wait or touch a pipe directly. The
//! socket core runs a transition under its lock, then applies the queued
//! effects (transmit on a pipe, arm or cancel a timer, fail blocked
//! receivers, drop a pipe) and re-polls its waiters.
//!
//! ```text
//! send/recv/deliver/on_timer ──► Pattern ──► Effects ──► SocketCore
//!                                   ▲                        │
//!                                   └──── re-poll waiters ◄──┘
//! ```

use std::collections::VecDeque;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashSet;
use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::{Message, ID_FLAG};
use nanoweave_core::options::SocketOptions;
use nanoweave_core::protocol::{Opener, Protocol};

pub mod pair;
pub mod pipeline;
pub mod pubsub;
pub mod raw;
pub mod reqrep;
pub mod survey;

pub use pair::Pair;
pub use pipeline::{Pull, Push};
pub use pubsub::{Pub, Sub};
pub use raw::Raw;
pub use reqrep::{Req, Responder};
pub use survey::Surveyor;

/// Result of a send transition.
#[derive(Debug)]
pub enum SendOutcome {
    /// Accepted (possibly dropped, for lossy patterns).
    Sent,
    /// No peer can take it yet; the message is handed back unchanged.
    Blocked(Message),
}

/// Where a receive looks for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvScope {
    pub ctx: ContextId,
    /// Only messages that arrived on this pipe.
    pub pipe: Option<PipeId>,
}

impl RecvScope {
    pub const fn context(ctx: ContextId) -> Self {
        Self { ctx, pipe: None }
    }

    pub const fn pipe(pipe: PipeId) -> Self {
        Self {
            ctx: ContextId::IMPLICIT,
            pipe: Some(pipe),
        }
    }
}

/// Which protocol timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-send an unanswered request
    Resend,
    /// Survey deadline
    SurveyEnd,
}

/// Identifies an armed protocol timer; `id` is the request or survey id
/// it was armed for, so a stale firing is recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub ctx: ContextId,
    pub kind: TimerKind,
    pub id: u32,
}

/// Side effect requested by a transition.
#[derive(Debug)]
pub enum Effect {
    Transmit { pipe: PipeId, msg: Message },
    /// Arm (or re-arm) the timer for `(token.ctx, token.kind)`.
    Schedule { after: Duration, token: TimerToken },
    /// Disarm the timer for `(ctx, kind)`, if armed.
    Cancel { ctx: ContextId, kind: TimerKind },
    /// Fail every receiver blocked on `ctx`.
    FailRecv { ctx: ContextId, error: WeaveError },
    ClosePipe(PipeId),
}

/// FIFO of effects produced by transitions.
#[derive(Debug, Default)]
pub struct Effects {
    queue: VecDeque<Effect>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transmit(&mut self, pipe: PipeId, msg: Message) {
        self.queue.push_back(Effect::Transmit { pipe, msg });
    }

    pub fn schedule(&mut self, after: Duration, token: TimerToken) {
        self.queue.push_back(Effect::Schedule { after, token });
    }

    pub fn cancel(&mut self, ctx: ContextId, kind: TimerKind) {
        self.queue.push_back(Effect::Cancel { ctx, kind });
    }

    pub fn fail_recv(&mut self, ctx: ContextId, error: WeaveError) {
        self.queue.push_back(Effect::FailRecv { ctx, error });
    }

    pub fn close_pipe(&mut self, pipe: PipeId) {
        self.queue.push_back(Effect::ClosePipe(pipe));
    }

    pub fn pop(&mut self) -> Option<Effect> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Take every queued effect.
    pub fn drain(&mut self) -> impl Iterator<Item = Effect> + '_ {
        self.queue.drain(..)
    }
}

/// The shared capability interface of every protocol state machine.
pub trait Pattern: Send {
    /// A pipe was established. Returning false rejects (and closes) it.
    fn add_pipe(&mut self, pipe: PipeId, fx: &mut Effects) -> bool;

    /// A pipe went away.
    fn remove_pipe(&mut self, pipe: PipeId, fx: &mut Effects);

    /// Create private state for a new context.
    fn open_context(&mut self, _ctx: ContextId) -> Result<()> {
        Err(WeaveError::not_supported("protocol has no contexts"))
    }

    /// Drop a context's state.
    fn close_context(&mut self, _ctx: ContextId, _fx: &mut Effects) {}

    /// Hand a message to the protocol for sending.
    fn send(&mut self, ctx: ContextId, msg: Message, fx: &mut Effects) -> Result<SendOutcome>;

    /// Try to produce a message. `Pending` means "wait and re-poll".
    fn recv(&mut self, scope: RecvScope, fx: &mut Effects) -> Result<Poll<Message>>;

    /// A message arrived on `pipe` (with `msg.pipe()` already set).
    fn deliver(&mut self, pipe: PipeId, msg: Message, fx: &mut Effects);

    /// An armed timer fired.
    fn on_timer(&mut self, _token: TimerToken, _fx: &mut Effects) {}

    /// Options changed.
    fn apply_options(&mut self, _options: &SocketOptions) {}

    /// `pipe`'s send buffer filled up (`writable == false`) or has room
    /// again.
    fn set_writable(&mut self, _pipe: PipeId, _writable: bool, _fx: &mut Effects) {}

    /// Whether another delivery fits the receive buffer. While false the
    /// core leaves messages queued on their pipes, so senders stall.
    fn can_accept(&self) -> bool {
        true
    }

    /// Take back a message that left [`recv`](Self::recv) but never
    /// reached its caller. It becomes the next one received on `scope`.
    fn unrecv(&mut self, _scope: RecvScope, _msg: Message) {}

    fn subscribe(&mut self, _ctx: ContextId, _prefix: Bytes) -> Result<()> {
        Err(WeaveError::not_supported("subscribe"))
    }

    fn unsubscribe(&mut self, _ctx: ContextId, _prefix: &[u8]) -> Result<()> {
        Err(WeaveError::not_supported("unsubscribe"))
    }

    fn replace_topics(&mut self, _ctx: ContextId, _topics: &[Bytes]) -> Result<()> {
        Err(WeaveError::not_supported("topics"))
    }

    fn topics(&self, _ctx: ContextId) -> Result<Vec<Bytes>> {
        Err(WeaveError::not_supported("topics"))
    }

    /// Whether pipes may be addressed individually (send and recv).
    fn supports_pipe_io(&self) -> bool {
        false
    }
}

/// The closed set of state machines a socket can run.
pub enum ProtocolState {
    Pair(Pair),
    Pub(Pub),
    Sub(Sub),
    Req(Req),
    Rep(Responder),
    Push(Push),
    Pull(Pull),
    Surveyor(Surveyor),
    Respondent(Responder),
    Raw(Raw),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            ProtocolState::Pair($m) => $body,
            ProtocolState::Pub($m) => $body,
            ProtocolState::Sub($m) => $body,
            ProtocolState::Req($m) => $body,
            ProtocolState::Rep($m) => $body,
            ProtocolState::Push($m) => $body,
            ProtocolState::Pull($m) => $body,
            ProtocolState::Surveyor($m) => $body,
            ProtocolState::Respondent($m) => $body,
            ProtocolState::Raw($m) => $body,
        }
    };
}

impl ProtocolState {
    /// Build the state machine an opener asks for.
    pub fn new(opener: Opener, options: &SocketOptions) -> Self {
        let protocol = opener.protocol();
        let mut state = if opener.is_raw() {
            Self::Raw(Raw::new(protocol))
        } else {
            match protocol {
                Protocol::Pair0 | Protocol::Pair1 => Self::Pair(Pair::new(protocol)),
                Protocol::Pub0 => Self::Pub(Pub::new()),
                Protocol::Sub0 => Self::Sub(Sub::new()),
                Protocol::Req0 => Self::Req(Req::new()),
                Protocol::Rep0 => Self::Rep(Responder::new(protocol)),
                Protocol::Push0 => Self::Push(Push::new()),
                Protocol::Pull0 => Self::Pull(Pull::new()),
                Protocol::Surveyor0 => Self::Surveyor(Surveyor::new()),
                Protocol::Respondent0 => Self::Respondent(Responder::new(protocol)),
            }
        };
        state.apply_options(options);
        state
    }
}

impl Pattern for ProtocolState {
    fn add_pipe(&mut self, pipe: PipeId, fx: &mut Effects) -> bool {
        dispatch!(self, m => m.add_pipe(pipe, fx))
    }

    fn remove_pipe(&mut self, pipe: PipeId, fx: &mut Effects) {
        dispatch!(self, m => m.remove_pipe(pipe, fx))
    }

    fn open_context(&mut self, ctx: ContextId) -> Result<()> {
        dispatch!(self, m => m.open_context(ctx))
    }

    fn close_context(&mut self, ctx: ContextId, fx: &mut Effects) {
        dispatch!(self, m => m.close_context(ctx, fx))
    }

    fn send(&mut self, ctx: ContextId, msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        dispatch!(self, m => m.send(ctx, msg, fx))
    }

    fn recv(&mut self, scope: RecvScope, fx: &mut Effects) -> Result<Poll<Message>> {
        dispatch!(self, m => m.recv(scope, fx))
    }

    fn deliver(&mut self, pipe: PipeId, msg: Message, fx: &mut Effects) {
        dispatch!(self, m => m.deliver(pipe, msg, fx))
    }

    fn on_timer(&mut self, token: TimerToken, fx: &mut Effects) {
        dispatch!(self, m => m.on_timer(token, fx))
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        dispatch!(self, m => m.apply_options(options))
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, fx: &mut Effects) {
        dispatch!(self, m => m.set_writable(pipe, writable, fx))
    }

    fn can_accept(&self) -> bool {
        dispatch!(self, m => m.can_accept())
    }

    fn unrecv(&mut self, scope: RecvScope, msg: Message) {
        dispatch!(self, m => m.unrecv(scope, msg))
    }

    fn subscribe(&mut self, ctx: ContextId, prefix: Bytes) -> Result<()> {
        dispatch!(self, m => m.subscribe(ctx, prefix))
    }

    fn unsubscribe(&mut self, ctx: ContextId, prefix: &[u8]) -> Result<()> {
        dispatch!(self, m => m.unsubscribe(ctx, prefix))
    }

    fn replace_topics(&mut self, ctx: ContextId, topics: &[Bytes]) -> Result<()> {
        dispatch!(self, m => m.replace_topics(ctx, topics))
    }

    fn topics(&self, ctx: ContextId) -> Result<Vec<Bytes>> {
        dispatch!(self, m => m.topics(ctx))
    }

    fn supports_pipe_io(&self) -> bool {
        dispatch!(self, m => m.supports_pipe_io())
    }
}

/// Round-robin peer selection over pipes in connection order. Pipes with
/// a full send buffer are passed over until they drain.
#[derive(Debug, Default, Clone)]
pub struct RoundRobin {
    pipes: Vec<PipeId>,
    cursor: usize,
    full: HashSet<PipeId>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pipe: PipeId) {
        if !self.pipes.contains(&pipe) {
            self.pipes.push(pipe);
        }
    }

    pub fn remove(&mut self, pipe: PipeId) -> bool {
        let Some(pos) = self.pipes.iter().position(|p| *p == pipe) else {
            return false;
        };
        self.pipes.remove(pos);
        self.full.remove(&pipe);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        // cursor might now be out of bounds; next() wraps it.
        true
    }

    /// Pick the next writable pipe and advance past it.
    pub fn next(&mut self) -> Option<PipeId> {
        for _ in 0..self.pipes.len() {
            if self.cursor >= self.pipes.len() {
                self.cursor = 0;
            }
            let pipe = self.pipes[self.cursor];
            self.cursor = (self.cursor + 1) % self.pipes.len();
            if !self.full.contains(&pipe) {
                return Some(pipe);
            }
        }
        None
    }

    pub fn set_writable(&mut self, pipe: PipeId, writable: bool) {
        if writable {
            self.full.remove(&pipe);
        } else if self.contains(pipe) {
            self.full.insert(pipe);
        }
    }

    pub fn is_writable(&self, pipe: PipeId) -> bool {
        self.contains(pipe) && !self.full.contains(&pipe)
    }

    /// Pipes with room in their send buffer, in connection order.
    pub fn writable(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.iter().filter(|p| !self.full.contains(p))
    }

    /// Longest-connected pipe.
    pub fn first(&self) -> Option<PipeId> {
        self.pipes.first().copied()
    }

    pub fn contains(&self, pipe: PipeId) -> bool {
        self.pipes.contains(&pipe)
    }

    pub fn iter(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.pipes.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

/// Request / survey id generator, randomly seeded per socket.
#[derive(Debug, Clone)]
pub struct IdSequence(u32);

impl IdSequence {
    pub fn seeded() -> Self {
        Self(rand::random())
    }

    /// Next id, always with the flag bit set.
    pub fn next_id(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        self.0 | ID_FLAG
    }
}

/// Strip protocol headers before handing a cooked message to the caller.
pub(crate) fn strip_headers(mut msg: Message) -> Message {
    msg.backtrace_mut().clear();
    msg
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn pipe(raw: u32) -> PipeId {
        PipeId::from_raw(raw)
    }

    /// All transmitted (pipe, body) pairs, other effects discarded.
    pub fn transmitted(fx: &mut Effects) -> Vec<(PipeId, Message)> {
        fx.drain()
            .filter_map(|e| match e {
                Effect::Transmit { pipe, msg } => Some((pipe, msg)),
                _ => None,
            })
            .collect()
    }
}
