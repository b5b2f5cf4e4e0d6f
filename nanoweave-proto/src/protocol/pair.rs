//! PAIR: symmetric peers, both sides send and receive freely.
//!
//! `pair0` and plain `pair1` hold one peer and reject the rest. A
//! polyamorous `pair1` keeps every peer and routes sends by the message's
//! pipe, falling back to the longest-connected peer.

use std::collections::VecDeque;
use std::task::Poll;

use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::Message;
use nanoweave_core::options::{SocketOptions, DEFAULT_BUFFER};
use nanoweave_core::protocol::Protocol;
use tracing::{debug, trace};

use super::{Effects, Pattern, RecvScope, RoundRobin, SendOutcome};

#[derive(Debug)]
pub struct Pair {
    version: Protocol,
    polyamorous: bool,
    pipes: RoundRobin,
    inbox: VecDeque<Message>,
    recv_buffer: usize,
}

impl Pair {
    pub fn new(version: Protocol) -> Self {
        Self {
            version,
            polyamorous: false,
            pipes: RoundRobin::new(),
            inbox: VecDeque::new(),
            recv_buffer: DEFAULT_BUFFER,
        }
    }

    pub fn is_polyamorous(&self) -> bool {
        self.polyamorous
    }
}

impl Pattern for Pair {
    fn add_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) -> bool {
        if !self.polyamorous && !self.pipes.is_empty() {
            debug!("[PAIR] {} rejected, already paired", pipe);
            return false;
        }
        self.pipes.add(pipe);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) {
        self.pipes.remove(pipe);
    }

    fn send(&mut self, _ctx: ContextId, msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        let target = match msg.pipe() {
            Some(pipe) if self.polyamorous => {
                if !self.pipes.contains(pipe) {
                    trace!("[PAIR] dropping message for departed {}", pipe);
                    return Ok(SendOutcome::Sent);
                }
                pipe
            }
            _ => match self.pipes.first() {
                Some(pipe) => pipe,
                None => return Ok(SendOutcome::Blocked(msg)),
            },
        };
        if !self.pipes.is_writable(target) {
            return Ok(SendOutcome::Blocked(msg));
        }
        fx.transmit(target, msg);
        Ok(SendOutcome::Sent)
    }

    fn recv(&mut self, scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        let found = match scope.pipe {
            None => self.inbox.pop_front(),
            Some(pipe) => {
                if !self.polyamorous {
                    return Err(WeaveError::not_supported("per-pipe receive needs polyamorous pair1"));
                }
                let pos = self.inbox.iter().position(|m| m.pipe() == Some(pipe));
                pos.and_then(|pos| self.inbox.remove(pos))
            }
        };
        Ok(found.map_or(Poll::Pending, Poll::Ready))
    }

    fn deliver(&mut self, _pipe: PipeId, msg: Message, _fx: &mut Effects) {
        self.inbox.push_back(msg);
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.polyamorous = self.version == Protocol::Pair1 && options.polyamorous;
        self.recv_buffer = options.recv_buffer;
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, _fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
    }

    fn can_accept(&self) -> bool {
        self.inbox.len() < self.recv_buffer
    }

    fn unrecv(&mut self, _scope: RecvScope, msg: Message) {
        self.inbox.push_front(msg);
    }

    fn supports_pipe_io(&self) -> bool {
        self.polyamorous
    }
}
