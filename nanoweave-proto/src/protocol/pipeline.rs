//! PUSH/PULL pipeline.

use std::collections::VecDeque;
use std::task::Poll;

use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::Message;
use nanoweave_core::options::{SocketOptions, DEFAULT_BUFFER};
use tracing::trace;

use super::{Effects, Pattern, RecvScope, RoundRobin, SendOutcome};

/// Distributes messages round-robin over connected pullers, passing over
/// any whose send buffer is full.
#[derive(Debug, Default)]
pub struct Push {
    pipes: RoundRobin,
}

impl Push {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pattern for Push {
    fn add_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) -> bool {
        self.pipes.add(pipe);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) {
        self.pipes.remove(pipe);
    }

    fn send(&mut self, _ctx: ContextId, msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        match self.pipes.next() {
            Some(pipe) => {
                trace!("[PUSH] -> {}", pipe);
                fx.transmit(pipe, msg);
                Ok(SendOutcome::Sent)
            }
            None => Ok(SendOutcome::Blocked(msg)),
        }
    }

    fn recv(&mut self, _scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        Err(WeaveError::not_supported("push sockets cannot receive"))
    }

    fn deliver(&mut self, pipe: PipeId, _msg: Message, _fx: &mut Effects) {
        trace!("[PUSH] ignoring inbound message from {}", pipe);
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, _fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
    }
}

/// Receives in arrival order.
#[derive(Debug)]
pub struct Pull {
    inbox: VecDeque<Message>,
    recv_buffer: usize,
}

impl Default for Pull {
    fn default() -> Self {
        Self {
            inbox: VecDeque::new(),
            recv_buffer: DEFAULT_BUFFER,
        }
    }
}

impl Pull {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pattern for Pull {
    fn add_pipe(&mut self, _pipe: PipeId, _fx: &mut Effects) -> bool {
        true
    }

    fn remove_pipe(&mut self, _pipe: PipeId, _fx: &mut Effects) {}

    fn send(&mut self, _ctx: ContextId, _msg: Message, _fx: &mut Effects) -> Result<SendOutcome> {
        Err(WeaveError::not_supported("pull sockets cannot send"))
    }

    fn recv(&mut self, _scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        Ok(self.inbox.pop_front().map_or(Poll::Pending, Poll::Ready))
    }

    fn deliver(&mut self, _pipe: PipeId, msg: Message, _fx: &mut Effects) {
        self.inbox.push_back(msg);
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.recv_buffer = options.recv_buffer;
    }

    fn can_accept(&self) -> bool {
        self.inbox.len() < self.recv_buffer
    }

    fn unrecv(&mut self, _scope: RecvScope, msg: Message) {
        self.inbox.push_front(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{pipe, transmitted};
    use nanoweave_core::error::ErrorKind;

    #[test]
    fn test_push_round_robin() {
        let mut fx = Effects::new();
        let mut push = Push::new();
        push.add_pipe(pipe(1), &mut fx);
        push.add_pipe(pipe(2), &mut fx);

        for body in ["a", "b", "c"] {
            push.send(ContextId::IMPLICIT, Message::from(body), &mut fx).unwrap();
        }
        let targets: Vec<_> = transmitted(&mut fx).into_iter().map(|(p, _)| p).collect();
        assert_eq!(targets, vec![pipe(1), pipe(2), pipe(1)]);
    }

    #[test]
    fn test_push_skips_full_pullers() {
        let mut fx = Effects::new();
        let mut push = Push::new();
        push.add_pipe(pipe(1), &mut fx);
        push.add_pipe(pipe(2), &mut fx);
        push.set_writable(pipe(1), false, &mut fx);

        push.send(ContextId::IMPLICIT, Message::from("a"), &mut fx).unwrap();
        push.send(ContextId::IMPLICIT, Message::from("b"), &mut fx).unwrap();
        let targets: Vec<_> = transmitted(&mut fx).into_iter().map(|(p, _)| p).collect();
        assert_eq!(targets, vec![pipe(2), pipe(2)]);

        push.set_writable(pipe(2), false, &mut fx);
        let out = push.send(ContextId::IMPLICIT, Message::from("c"), &mut fx).unwrap();
        assert!(matches!(out, SendOutcome::Blocked(m) if m.as_bytes() == b"c"));

        push.set_writable(pipe(1), true, &mut fx);
        push.send(ContextId::IMPLICIT, Message::from("c"), &mut fx).unwrap();
        assert_eq!(transmitted(&mut fx)[0].0, pipe(1));
    }

    #[test]
    fn test_push_blocks_without_pullers() {
        let mut fx = Effects::new();
        let mut push = Push::new();
        let out = push.send(ContextId::IMPLICIT, Message::from("x"), &mut fx).unwrap();
        assert!(matches!(out, SendOutcome::Blocked(m) if m.as_bytes() == b"x"));
        let err = push.recv(RecvScope::context(ContextId::IMPLICIT), &mut fx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_pull_fifo() {
        let mut fx = Effects::new();
        let mut pull = Pull::new();
        let scope = RecvScope::context(ContextId::IMPLICIT);
        assert!(pull.recv(scope, &mut fx).unwrap().is_pending());

        pull.deliver(pipe(1), Message::from("first"), &mut fx);
        pull.deliver(pipe(2), Message::from("second"), &mut fx);
        assert!(matches!(pull.recv(scope, &mut fx).unwrap(), Poll::Ready(m) if m.as_bytes() == b"first"));
        assert!(matches!(pull.recv(scope, &mut fx).unwrap(), Poll::Ready(m) if m.as_bytes() == b"second"));

        let err = pull.send(ContextId::IMPLICIT, Message::from("no"), &mut fx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_pull_receive_buffer() {
        let mut fx = Effects::new();
        let mut pull = Pull::new();
        pull.apply_options(&SocketOptions::new().with_recv_buffer(2));
        let scope = RecvScope::context(ContextId::IMPLICIT);

        pull.deliver(pipe(1), Message::from("first"), &mut fx);
        assert!(pull.can_accept());
        pull.deliver(pipe(1), Message::from("second"), &mut fx);
        assert!(!pull.can_accept());

        let Poll::Ready(first) = pull.recv(scope, &mut fx).unwrap() else {
            panic!("expected a message");
        };
        assert!(pull.can_accept());
        pull.unrecv(scope, first);
        assert!(matches!(pull.recv(scope, &mut fx).unwrap(), Poll::Ready(m) if m.as_bytes() == b"first"));
    }
}
