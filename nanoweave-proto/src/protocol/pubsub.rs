//! PUB/SUB with topic prefix filtering.
//!
//! The publisher broadcasts to every pipe and never blocks; a pipe whose
//! send buffer is full misses the message. Each subscriber context keeps
//! its own filter set and queue; a message is copied into every context
//! whose filters match its topic (or body prefix). A full context queue
//! drops its oldest message to make room.

use std::collections::VecDeque;
use std::task::Poll;

use bytes::Bytes;
use hashbrown::HashMap;
use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::Message;
use nanoweave_core::options::{SocketOptions, DEFAULT_BUFFER};
use nanoweave_core::subscription::SubscriptionSet;
use tracing::trace;

use super::{Effects, Pattern, RecvScope, RoundRobin, SendOutcome};

/// Publisher.
#[derive(Debug, Default)]
pub struct Pub {
    pipes: RoundRobin,
}

impl Pub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pattern for Pub {
    fn add_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) -> bool {
        self.pipes.add(pipe);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) {
        self.pipes.remove(pipe);
    }

    fn send(&mut self, _ctx: ContextId, msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        trace!("[PUB] broadcasting to {} pipes", self.pipes.len());
        for pipe in self.pipes.iter() {
            if self.pipes.is_writable(pipe) {
                fx.transmit(pipe, msg.clone());
            } else {
                trace!("[PUB] {} is full, message dropped", pipe);
            }
        }
        Ok(SendOutcome::Sent)
    }

    fn recv(&mut self, _scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        Err(WeaveError::not_supported("pub sockets cannot receive"))
    }

    fn deliver(&mut self, _pipe: PipeId, _msg: Message, _fx: &mut Effects) {}

    fn set_writable(&mut self, pipe: PipeId, writable: bool, _fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
    }
}

#[derive(Debug, Default)]
struct SubContext {
    filters: SubscriptionSet,
    inbox: VecDeque<Message>,
}

/// Subscriber.
#[derive(Debug)]
pub struct Sub {
    contexts: HashMap<ContextId, SubContext>,
    recv_buffer: usize,
}

impl Default for Sub {
    fn default() -> Self {
        Self::new()
    }
}

impl Sub {
    pub fn new() -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(ContextId::IMPLICIT, SubContext::default());
        Self {
            contexts,
            recv_buffer: DEFAULT_BUFFER,
        }
    }

    fn context(&mut self, ctx: ContextId) -> Result<&mut SubContext> {
        self.contexts.get_mut(&ctx).ok_or(WeaveError::Closed)
    }
}

impl Pattern for Sub {
    fn add_pipe(&mut self, _pipe: PipeId, _fx: &mut Effects) -> bool {
        true
    }

    fn remove_pipe(&mut self, _pipe: PipeId, _fx: &mut Effects) {}

    fn open_context(&mut self, ctx: ContextId) -> Result<()> {
        self.contexts.insert(ctx, SubContext::default());
        Ok(())
    }

    fn close_context(&mut self, ctx: ContextId, _fx: &mut Effects) {
        self.contexts.remove(&ctx);
    }

    fn send(&mut self, _ctx: ContextId, _msg: Message, _fx: &mut Effects) -> Result<SendOutcome> {
        Err(WeaveError::not_supported("sub sockets cannot send"))
    }

    fn recv(&mut self, scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        let context = self.context(scope.ctx)?;
        Ok(context.inbox.pop_front().map_or(Poll::Pending, Poll::Ready))
    }

    fn deliver(&mut self, pipe: PipeId, msg: Message, _fx: &mut Effects) {
        let mut matched = 0usize;
        for context in self.contexts.values_mut() {
            if context.filters.matches(msg.filter_key()) {
                if context.inbox.len() >= self.recv_buffer {
                    context.inbox.pop_front();
                    trace!("[SUB] queue full, dropped oldest message");
                }
                context.inbox.push_back(msg.clone());
                matched += 1;
            }
        }
        if matched == 0 {
            trace!("[SUB] dropped unmatched message from {}", pipe);
        }
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.recv_buffer = options.recv_buffer;
    }

    fn unrecv(&mut self, scope: RecvScope, msg: Message) {
        if let Some(context) = self.contexts.get_mut(&scope.ctx) {
            context.inbox.push_front(msg);
        }
    }

    fn subscribe(&mut self, ctx: ContextId, prefix: Bytes) -> Result<()> {
        self.context(ctx)?.filters.subscribe(prefix);
        Ok(())
    }

    fn unsubscribe(&mut self, ctx: ContextId, prefix: &[u8]) -> Result<()> {
        self.context(ctx)?.filters.unsubscribe(prefix)
    }

    fn replace_topics(&mut self, ctx: ContextId, topics: &[Bytes]) -> Result<()> {
        self.context(ctx)?.filters.replace(topics);
        Ok(())
    }

    fn topics(&self, ctx: ContextId) -> Result<Vec<Bytes>> {
        self.contexts
            .get(&ctx)
            .map(|c| c.filters.prefixes())
            .ok_or(WeaveError::Closed)
    }
}
