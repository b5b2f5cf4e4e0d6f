//! Raw mode: no state machine, headers exposed.
//!
//! Sends go to the message's pipe when set, else broadcast (pub, surveyor)
//! or round robin. Received messages keep their backtrace and pipe so an
//! application (a device, say) can route replies itself. Direction limits
//! of the protocol still apply, and so do the buffers: a raw sub drops its
//! oldest message when full, every other receiver stops taking more.

use std::collections::VecDeque;
use std::task::Poll;

use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::Message;
use nanoweave_core::options::{SocketOptions, DEFAULT_BUFFER};
use nanoweave_core::protocol::Protocol;
use tracing::trace;

use super::{Effects, Pattern, RecvScope, RoundRobin, SendOutcome};

#[derive(Debug)]
pub struct Raw {
    protocol: Protocol,
    polyamorous: bool,
    pipes: RoundRobin,
    inbox: VecDeque<Message>,
    recv_buffer: usize,
}

impl Raw {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            polyamorous: false,
            pipes: RoundRobin::new(),
            inbox: VecDeque::new(),
            recv_buffer: DEFAULT_BUFFER,
        }
    }

    fn broadcasts(&self) -> bool {
        matches!(self.protocol, Protocol::Pub0 | Protocol::Surveyor0)
    }

    fn lossy(&self) -> bool {
        self.protocol == Protocol::Sub0
    }

    fn single_peer(&self) -> bool {
        matches!(self.protocol, Protocol::Pair0 | Protocol::Pair1) && !self.polyamorous
    }
}

impl Pattern for Raw {
    fn add_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) -> bool {
        if self.single_peer() && !self.pipes.is_empty() {
            return false;
        }
        self.pipes.add(pipe);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) {
        self.pipes.remove(pipe);
    }

    fn send(&mut self, _ctx: ContextId, msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        if !self.protocol.can_send() {
            return Err(WeaveError::not_supported(format!("{} cannot send", self.protocol)));
        }
        if let Some(pipe) = msg.pipe() {
            if !self.pipes.contains(pipe) {
                trace!("[RAW] {} gone, message dropped", pipe);
            } else if !self.pipes.is_writable(pipe) {
                return Ok(SendOutcome::Blocked(msg));
            } else {
                fx.transmit(pipe, msg);
            }
            return Ok(SendOutcome::Sent);
        }
        if self.broadcasts() {
            for pipe in self.pipes.writable() {
                fx.transmit(pipe, msg.clone());
            }
            return Ok(SendOutcome::Sent);
        }
        match self.pipes.next() {
            Some(pipe) => {
                fx.transmit(pipe, msg);
                Ok(SendOutcome::Sent)
            }
            None => Ok(SendOutcome::Blocked(msg)),
        }
    }

    fn recv(&mut self, _scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        if !self.protocol.can_recv() {
            return Err(WeaveError::not_supported(format!("{} cannot receive", self.protocol)));
        }
        Ok(self.inbox.pop_front().map_or(Poll::Pending, Poll::Ready))
    }

    fn deliver(&mut self, _pipe: PipeId, msg: Message, _fx: &mut Effects) {
        if !self.protocol.can_recv() {
            return;
        }
        if self.lossy() && self.inbox.len() >= self.recv_buffer {
            self.inbox.pop_front();
        }
        self.inbox.push_back(msg);
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.polyamorous = self.protocol == Protocol::Pair1 && options.polyamorous;
        self.recv_buffer = options.recv_buffer;
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, _fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
    }

    fn can_accept(&self) -> bool {
        self.lossy() || self.inbox.len() < self.recv_buffer
    }

    fn unrecv(&mut self, _scope: RecvScope, msg: Message) {
        self.inbox.push_front(msg);
    }
}
