//! REQ/REP with per-context strict alternation.
//!
//! # State Machine (per context)
//!
//! ```text
//! REQ:  Idle → send() → AwaitingReply → recv() → Idle
//! REP:  AwaitingRequest → recv() → ReadyToReply → send() → AwaitingRequest
//! ```
//!
//! Requests carry a request id (flag bit set) on their backtrace. The
//! responder remembers the backtrace and the pipe a request came from and
//! sends the reply back along it. [`Responder`] also serves `respondent0`,
//! whose survey ids travel the same way.

use std::collections::VecDeque;
use std::task::Poll;
use std::time::Duration;

use hashbrown::HashMap;
use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::{Backtrace, Message};
use nanoweave_core::options::{SocketOptions, DEFAULT_BUFFER};
use nanoweave_core::protocol::Protocol;
use tracing::{debug, trace};

use super::{strip_headers, Effects, IdSequence, Pattern, RecvScope, RoundRobin, SendOutcome, TimerKind, TimerToken};

/// REQ context state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReqState {
    /// Ready to send a request
    Idle,
    /// Waiting for a reply after sending request
    AwaitingReply {
        id: u32,
        /// Pipe the request went out on; `None` while waiting for one.
        pipe: Option<PipeId>,
        reply: Option<Message>,
    },
}

#[derive(Debug)]
struct ReqContext {
    state: ReqState,
    /// Copy of the outstanding request, kept for re-sending.
    request: Option<Message>,
    /// Id of the last request whose reply was handed out.
    answered: u32,
}

impl ReqContext {
    const fn new() -> Self {
        Self {
            state: ReqState::Idle,
            request: None,
            answered: 0,
        }
    }
}

/// Requester.
#[derive(Debug)]
pub struct Req {
    pipes: RoundRobin,
    contexts: HashMap<ContextId, ReqContext>,
    ids: IdSequence,
    resend_time: Option<Duration>,
}

impl Default for Req {
    fn default() -> Self {
        Self::new()
    }
}

impl Req {
    pub fn new() -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(ContextId::IMPLICIT, ReqContext::new());
        Self {
            pipes: RoundRobin::new(),
            contexts,
            ids: IdSequence::seeded(),
            resend_time: SocketOptions::default().resend_time,
        }
    }

    /// Current state of a context (for tests and debugging).
    pub fn state(&self, ctx: ContextId) -> Option<&ReqState> {
        self.contexts.get(&ctx).map(|c| &c.state)
    }

    /// Put the outstanding request of `ctx` on the next pipe, if any.
    fn transmit_request(
        pipes: &mut RoundRobin,
        resend_time: Option<Duration>,
        ctx: ContextId,
        context: &mut ReqContext,
        fx: &mut Effects,
    ) {
        let ReqState::AwaitingReply { id, pipe, reply: None } = &mut context.state else {
            return;
        };
        let Some(request) = context.request.as_ref() else {
            return;
        };
        *pipe = pipes.next();
        if let Some(target) = *pipe {
            trace!("[REQ] request {:#x} -> {}", id, target);
            fx.transmit(target, request.clone());
            if let Some(after) = resend_time {
                fx.schedule(
                    after,
                    TimerToken {
                        ctx,
                        kind: TimerKind::Resend,
                        id: *id,
                    },
                );
            }
        }
    }

    /// Send requests stranded without a pipe.
    fn transmit_stranded(&mut self, fx: &mut Effects) {
        for (ctx, context) in &mut self.contexts {
            if matches!(context.state, ReqState::AwaitingReply { pipe: None, reply: None, .. }) {
                Self::transmit_request(&mut self.pipes, self.resend_time, *ctx, context, fx);
            }
        }
    }
}

impl Pattern for Req {
    fn add_pipe(&mut self, pipe: PipeId, fx: &mut Effects) -> bool {
        self.pipes.add(pipe);
        self.transmit_stranded(fx);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, fx: &mut Effects) {
        self.pipes.remove(pipe);
        for (ctx, context) in &mut self.contexts {
            if matches!(context.state, ReqState::AwaitingReply { pipe: Some(p), reply: None, .. } if p == pipe)
            {
                debug!("[REQ] {} lost, re-sending request for {}", pipe, ctx);
                Self::transmit_request(&mut self.pipes, self.resend_time, *ctx, context, fx);
            }
        }
    }

    fn open_context(&mut self, ctx: ContextId) -> Result<()> {
        self.contexts.insert(ctx, ReqContext::new());
        Ok(())
    }

    fn close_context(&mut self, ctx: ContextId, _fx: &mut Effects) {
        self.contexts.remove(&ctx);
    }

    fn send(&mut self, ctx: ContextId, mut msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        if !self.contexts.contains_key(&ctx) {
            return Err(WeaveError::Closed);
        }
        if self.pipes.writable().next().is_none() {
            return Ok(SendOutcome::Blocked(msg));
        }

        let id = self.ids.next_id();
        msg.backtrace_mut().clear();
        msg.push_id(id);
        msg.set_pipe(None);

        let Some(context) = self.contexts.get_mut(&ctx) else {
            return Err(WeaveError::Closed);
        };
        if let ReqState::AwaitingReply { id: old, .. } = context.state {
            debug!("[REQ] abandoning request {:#x} on {}", old, ctx);
        }
        context.state = ReqState::AwaitingReply {
            id,
            pipe: None,
            reply: None,
        };
        context.request = Some(msg);
        Self::transmit_request(&mut self.pipes, self.resend_time, ctx, context, fx);
        Ok(SendOutcome::Sent)
    }

    fn recv(&mut self, scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        let context = self.contexts.get_mut(&scope.ctx).ok_or(WeaveError::Closed)?;
        match &mut context.state {
            ReqState::Idle => Err(WeaveError::bad_state("no request outstanding, send first")),
            ReqState::AwaitingReply { reply, .. } => match reply.take() {
                Some(msg) => {
                    if let ReqState::AwaitingReply { id, .. } = context.state {
                        context.answered = id;
                    }
                    context.state = ReqState::Idle;
                    context.request = None;
                    Ok(Poll::Ready(msg))
                }
                None => Ok(Poll::Pending),
            },
        }
    }

    fn deliver(&mut self, pipe: PipeId, msg: Message, fx: &mut Effects) {
        let Some(reply_id) = msg.request_id() else {
            trace!("[REQ] dropping reply without request id from {}", pipe);
            return;
        };
        let waiting = self.contexts.iter_mut().find_map(|(ctx, c)| match &mut c.state {
            ReqState::AwaitingReply { id, reply, .. } if *id == reply_id && reply.is_none() => Some((*ctx, reply)),
            _ => None,
        });
        match waiting {
            Some((ctx, slot)) => {
                *slot = Some(strip_headers(msg));
                fx.cancel(ctx, TimerKind::Resend);
            }
            None => trace!("[REQ] dropping stale reply {:#x}", reply_id),
        }
    }

    fn on_timer(&mut self, token: TimerToken, fx: &mut Effects) {
        if token.kind != TimerKind::Resend {
            return;
        }
        let Some(context) = self.contexts.get_mut(&token.ctx) else {
            return;
        };
        if matches!(context.state, ReqState::AwaitingReply { id, reply: None, .. } if id == token.id) {
            debug!("[REQ] resend timer fired for {:#x}", token.id);
            Self::transmit_request(&mut self.pipes, self.resend_time, token.ctx, context, fx);
        }
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.resend_time = options.resend_time;
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
        if writable {
            self.transmit_stranded(fx);
        }
    }

    fn unrecv(&mut self, scope: RecvScope, msg: Message) {
        let Some(context) = self.contexts.get_mut(&scope.ctx) else {
            return;
        };
        // Only while no newer request has been sent
        if context.state == ReqState::Idle {
            context.state = ReqState::AwaitingReply {
                id: context.answered,
                pipe: None,
                reply: Some(msg),
            };
        }
    }
}

#[derive(Debug, Default)]
struct ResponderContext {
    /// Where the reply goes, set by recv and consumed by send.
    route: Option<(PipeId, Backtrace)>,
}

/// Responder side of REQ/REP and SURVEYOR/RESPONDENT.
#[derive(Debug)]
pub struct Responder {
    kind: Protocol,
    pipes: RoundRobin,
    inbox: VecDeque<Message>,
    contexts: HashMap<ContextId, ResponderContext>,
    recv_buffer: usize,
}

impl Responder {
    pub fn new(kind: Protocol) -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(ContextId::IMPLICIT, ResponderContext::default());
        Self {
            kind,
            pipes: RoundRobin::new(),
            inbox: VecDeque::new(),
            contexts,
            recv_buffer: DEFAULT_BUFFER,
        }
    }

    /// Whether `ctx` holds a request it has not answered yet.
    pub fn is_ready_to_reply(&self, ctx: ContextId) -> bool {
        self.contexts.get(&ctx).is_some_and(|c| c.route.is_some())
    }
}

impl Pattern for Responder {
    fn add_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) -> bool {
        self.pipes.add(pipe);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) {
        self.pipes.remove(pipe);
        self.inbox.retain(|m| m.pipe() != Some(pipe));
    }

    fn open_context(&mut self, ctx: ContextId) -> Result<()> {
        self.contexts.insert(ctx, ResponderContext::default());
        Ok(())
    }

    fn close_context(&mut self, ctx: ContextId, _fx: &mut Effects) {
        self.contexts.remove(&ctx);
    }

    fn send(&mut self, ctx: ContextId, mut msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        let context = self.contexts.get_mut(&ctx).ok_or(WeaveError::Closed)?;
        let Some((pipe, backtrace)) = context.route.take() else {
            return Err(WeaveError::bad_state(format!(
                "{} must receive before replying",
                self.kind
            )));
        };
        if !self.pipes.contains(pipe) {
            trace!("[{}] reply dropped, {} is gone", self.kind, pipe);
            return Ok(SendOutcome::Sent);
        }
        if !self.pipes.is_writable(pipe) {
            context.route = Some((pipe, backtrace));
            return Ok(SendOutcome::Blocked(msg));
        }
        msg.set_backtrace(backtrace);
        msg.set_pipe(None);
        fx.transmit(pipe, msg);
        Ok(SendOutcome::Sent)
    }

    fn recv(&mut self, scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        if !self.contexts.contains_key(&scope.ctx) {
            return Err(WeaveError::Closed);
        }
        let Some(mut msg) = self.inbox.pop_front() else {
            return Ok(Poll::Pending);
        };
        let Some(pipe) = msg.pipe() else {
            return Ok(Poll::Pending);
        };
        let backtrace = msg.take_backtrace();
        if let Some(context) = self.contexts.get_mut(&scope.ctx) {
            // A newer request replaces an unanswered one
            context.route = Some((pipe, backtrace));
        }
        Ok(Poll::Ready(msg))
    }

    fn deliver(&mut self, pipe: PipeId, msg: Message, _fx: &mut Effects) {
        if msg.request_id().is_none() {
            trace!("[{}] dropping message without id from {}", self.kind, pipe);
            return;
        }
        self.inbox.push_back(msg);
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.recv_buffer = options.recv_buffer;
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, _fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
    }

    fn can_accept(&self) -> bool {
        self.inbox.len() < self.recv_buffer
    }

    fn unrecv(&mut self, scope: RecvScope, mut msg: Message) {
        let Some(context) = self.contexts.get_mut(&scope.ctx) else {
            return;
        };
        let Some((pipe, backtrace)) = context.route.take() else {
            return;
        };
        msg.set_backtrace(backtrace);
        msg.set_pipe(Some(pipe));
        self.inbox.push_front(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{pipe, transmitted};
    use crate::protocol::Effect;
    use nanoweave_core::error::ErrorKind;
    use nanoweave_core::message::ID_FLAG;

    const MAIN: ContextId = ContextId::IMPLICIT;

    fn recv_now(p: &mut impl Pattern, ctx: ContextId) -> Result<Poll<Message>> {
        p.recv(RecvScope::context(ctx), &mut Effects::new())
    }

    fn no_resend() -> Req {
        let mut req = Req::new();
        req.apply_options(&SocketOptions::new().with_resend_time(None));
        req
    }

    #[test]
    fn test_recv_before_send_is_bad_state() {
        let mut req = Req::new();
        let err = recv_now(&mut req, MAIN).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadState);

        let mut rep = Responder::new(Protocol::Rep0);
        let err = rep.send(MAIN, Message::from("x"), &mut Effects::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadState);
    }

    #[test]
    fn test_round_trip() {
        let mut fx = Effects::new();
        let mut req = no_resend();
        let mut rep = Responder::new(Protocol::Rep0);
        req.add_pipe(pipe(1), &mut fx);
        rep.add_pipe(pipe(2), &mut fx);

        req.send(MAIN, Message::from("ping"), &mut fx).unwrap();
        let (_, request) = transmitted(&mut fx).remove(0);
        assert!(request.request_id().is_some());

        rep.deliver(pipe(2), request.to_pipe(pipe(2)), &mut fx);
        let got = recv_now(&mut rep, MAIN).unwrap();
        let Poll::Ready(got) = got else { panic!("request not ready") };
        assert_eq!(got.as_bytes(), b"ping");
        assert!(got.backtrace().is_empty());
        assert!(rep.is_ready_to_reply(MAIN));

        rep.send(MAIN, Message::from("pong"), &mut fx).unwrap();
        let (to, reply) = transmitted(&mut fx).remove(0);
        assert_eq!(to, pipe(2));

        req.deliver(pipe(1), reply.to_pipe(pipe(1)), &mut fx);
        let Poll::Ready(got) = recv_now(&mut req, MAIN).unwrap() else { panic!("reply not ready") };
        assert_eq!(got.as_bytes(), b"pong");
        assert_eq!(req.state(MAIN), Some(&ReqState::Idle));

        // Second reply without a request
        let err = rep.send(MAIN, Message::from("again"), &mut fx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadState);
    }

    #[test]
    fn test_new_request_abandons_old() {
        let mut fx = Effects::new();
        let mut req = no_resend();
        req.add_pipe(pipe(1), &mut fx);

        req.send(MAIN, Message::from("first"), &mut fx).unwrap();
        let (_, first) = transmitted(&mut fx).remove(0);
        req.send(MAIN, Message::from("second"), &mut fx).unwrap();
        let (_, second) = transmitted(&mut fx).remove(0);

        let mut stale = Message::from("late");
        stale.set_backtrace(first.backtrace().into());
        req.deliver(pipe(1), stale, &mut fx);
        assert!(recv_now(&mut req, MAIN).unwrap().is_pending());

        let mut fresh = Message::from("fresh");
        fresh.set_backtrace(second.backtrace().into());
        req.deliver(pipe(1), fresh, &mut fx);
        assert!(matches!(recv_now(&mut req, MAIN).unwrap(), Poll::Ready(m) if m.as_bytes() == b"fresh"));
    }

    #[test]
    fn test_send_blocks_without_pipe() {
        let mut req = Req::new();
        let out = req.send(MAIN, Message::from("x"), &mut Effects::new()).unwrap();
        assert!(matches!(out, SendOutcome::Blocked(_)));
        assert_eq!(req.state(MAIN), Some(&ReqState::Idle));
    }

    #[test]
    fn test_resend_on_pipe_loss() {
        let mut fx = Effects::new();
        let mut req = no_resend();
        req.add_pipe(pipe(1), &mut fx);
        req.send(MAIN, Message::from("work"), &mut fx).unwrap();
        assert_eq!(transmitted(&mut fx)[0].0, pipe(1));

        // Lost with nowhere to go: parked
        req.remove_pipe(pipe(1), &mut fx);
        assert!(fx.is_empty());

        // A new pipe picks it up
        req.add_pipe(pipe(2), &mut fx);
        let sent = transmitted(&mut fx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, pipe(2));
        assert_eq!(sent[0].1.as_bytes(), b"work");
    }

    #[test]
    fn test_resend_timer() {
        let mut fx = Effects::new();
        let mut req = Req::new();
        req.apply_options(&SocketOptions::new().with_resend_time(Some(Duration::from_millis(10))));
        req.add_pipe(pipe(1), &mut fx);
        req.send(MAIN, Message::from("work"), &mut fx).unwrap();

        let token = fx
            .drain()
            .find_map(|e| match e {
                super::super::Effect::Schedule { token, .. } => Some(token),
                _ => None,
            })
            .unwrap();
        assert_eq!(token.kind, TimerKind::Resend);

        req.on_timer(token, &mut fx);
        assert_eq!(transmitted(&mut fx).len(), 1);

        // A stale token does nothing
        req.on_timer(TimerToken { id: token.id ^ 1, ..token }, &mut fx);
        assert!(fx.is_empty());
    }

    #[test]
    fn test_reply_cancels_resend_timer() {
        let mut fx = Effects::new();
        let mut req = Req::new();
        req.apply_options(&SocketOptions::new().with_resend_time(Some(Duration::from_secs(60))));
        req.add_pipe(pipe(1), &mut fx);
        req.send(MAIN, Message::from("work"), &mut fx).unwrap();
        let (_, request) = transmitted(&mut fx).remove(0);

        let mut reply = Message::from("done");
        reply.set_backtrace(request.backtrace().into());
        req.deliver(pipe(1), reply, &mut fx);

        let effects: Vec<_> = fx.drain().collect();
        assert!(matches!(
            effects.as_slice(),
            [Effect::Cancel { ctx, kind: TimerKind::Resend }] if *ctx == MAIN
        ));
    }

    #[test]
    fn test_send_waits_for_writable_pipe() {
        let mut fx = Effects::new();
        let mut req = no_resend();
        req.add_pipe(pipe(1), &mut fx);
        req.set_writable(pipe(1), false, &mut fx);

        let out = req.send(MAIN, Message::from("x"), &mut fx).unwrap();
        assert!(matches!(out, SendOutcome::Blocked(_)));
        assert_eq!(req.state(MAIN), Some(&ReqState::Idle));

        req.set_writable(pipe(1), true, &mut fx);
        req.send(MAIN, Message::from("x"), &mut fx).unwrap();
        assert_eq!(transmitted(&mut fx)[0].0, pipe(1));
    }

    #[test]
    fn test_returned_reply_is_received_again() {
        let mut fx = Effects::new();
        let mut req = no_resend();
        req.add_pipe(pipe(1), &mut fx);
        req.send(MAIN, Message::from("ping"), &mut fx).unwrap();
        let (_, request) = transmitted(&mut fx).remove(0);
        let mut reply = Message::from("pong");
        reply.set_backtrace(request.backtrace().into());
        req.deliver(pipe(1), reply, &mut fx);

        let Poll::Ready(got) = recv_now(&mut req, MAIN).unwrap() else { panic!("reply not ready") };
        req.unrecv(RecvScope::context(MAIN), got);
        let Poll::Ready(again) = recv_now(&mut req, MAIN).unwrap() else { panic!("reply not returned") };
        assert_eq!(again.as_bytes(), b"pong");
        assert_eq!(req.state(MAIN), Some(&ReqState::Idle));
    }

    #[test]
    fn test_reply_waits_for_full_pipe() {
        let mut fx = Effects::new();
        let mut rep = Responder::new(Protocol::Rep0);
        rep.add_pipe(pipe(3), &mut fx);
        let mut request = Message::from("q").to_pipe(pipe(3));
        request.push_id(7);
        rep.deliver(pipe(3), request, &mut fx);
        assert!(recv_now(&mut rep, MAIN).unwrap().is_ready());

        rep.set_writable(pipe(3), false, &mut fx);
        let out = rep.send(MAIN, Message::from("a"), &mut fx).unwrap();
        assert!(matches!(out, SendOutcome::Blocked(_)));
        assert!(rep.is_ready_to_reply(MAIN));

        rep.set_writable(pipe(3), true, &mut fx);
        rep.send(MAIN, Message::from("a"), &mut fx).unwrap();
        let (to, reply) = transmitted(&mut fx).remove(0);
        assert_eq!(to, pipe(3));
        assert_eq!(reply.request_id(), Some(7 | ID_FLAG));
    }

    #[test]
    fn test_responder_buffer_and_return() {
        let mut fx = Effects::new();
        let mut rep = Responder::new(Protocol::Rep0);
        rep.apply_options(&SocketOptions::new().with_recv_buffer(1));
        rep.add_pipe(pipe(3), &mut fx);
        let mut request = Message::from("q").to_pipe(pipe(3));
        request.push_id(7);
        rep.deliver(pipe(3), request, &mut fx);
        assert!(!rep.can_accept());

        let Poll::Ready(got) = recv_now(&mut rep, MAIN).unwrap() else { panic!("request not ready") };
        assert!(rep.can_accept());
        rep.unrecv(RecvScope::context(MAIN), got);
        assert!(!rep.is_ready_to_reply(MAIN));

        let Poll::Ready(again) = recv_now(&mut rep, MAIN).unwrap() else { panic!("request not returned") };
        assert_eq!(again.as_bytes(), b"q");
        rep.send(MAIN, Message::from("a"), &mut fx).unwrap();
        assert_eq!(transmitted(&mut fx)[0].1.request_id(), Some(7 | ID_FLAG));
    }

    #[test]
    fn test_contexts_are_independent() {
        let mut fx = Effects::new();
        let mut req = no_resend();
        let ctx = ContextId::from_raw(9);
        req.open_context(ctx).unwrap();
        req.add_pipe(pipe(1), &mut fx);

        req.send(ctx, Message::from("on ctx"), &mut fx).unwrap();
        assert_eq!(recv_now(&mut req, MAIN).unwrap_err().kind(), ErrorKind::BadState);
        assert!(recv_now(&mut req, ctx).unwrap().is_pending());

        req.close_context(ctx, &mut fx);
        assert_eq!(recv_now(&mut req, ctx).unwrap_err(), WeaveError::Closed);
    }

    #[test]
    fn test_reply_to_departed_pipe_is_dropped() {
        let mut fx = Effects::new();
        let mut rep = Responder::new(Protocol::Rep0);
        rep.add_pipe(pipe(4), &mut fx);
        let mut request = Message::from("q").to_pipe(pipe(4));
        request.push_id(1);
        rep.deliver(pipe(4), request, &mut fx);
        assert!(recv_now(&mut rep, MAIN).unwrap().is_ready());

        rep.remove_pipe(pipe(4), &mut fx);
        let out = rep.send(MAIN, Message::from("a"), &mut fx).unwrap();
        assert!(matches!(out, SendOutcome::Sent));
        assert!(fx.is_empty());
    }
}
