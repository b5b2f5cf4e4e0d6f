//! SURVEYOR: broadcast a survey, collect answers until the deadline.
//!
//! Each send starts a fresh survey on its context (the previous one is
//! abandoned) and arms the survey timer. When the timer fires the context
//! forgets the survey, discards unread answers and fails blocked receivers
//! with `Timeout`; receiving then fails with `BadState` until the next
//! survey. Answers beyond the receive buffer are dropped. The respondent
//! side is [`Responder`](super::Responder).

use std::collections::VecDeque;
use std::task::Poll;
use std::time::Duration;

use hashbrown::HashMap;
use nanoweave_core::error::{Result, WeaveError};
use nanoweave_core::ids::{ContextId, PipeId};
use nanoweave_core::message::Message;
use nanoweave_core::options::{SocketOptions, DEFAULT_BUFFER};
use tracing::{debug, trace};

use super::{strip_headers, Effects, IdSequence, Pattern, RecvScope, RoundRobin, SendOutcome, TimerKind, TimerToken};

#[derive(Debug, Default)]
struct SurveyContext {
    survey: Option<u32>,
    answers: VecDeque<Message>,
}

#[derive(Debug)]
pub struct Surveyor {
    pipes: RoundRobin,
    contexts: HashMap<ContextId, SurveyContext>,
    ids: IdSequence,
    survey_time: Duration,
    recv_buffer: usize,
}

impl Default for Surveyor {
    fn default() -> Self {
        Self::new()
    }
}

impl Surveyor {
    pub fn new() -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(ContextId::IMPLICIT, SurveyContext::default());
        Self {
            pipes: RoundRobin::new(),
            contexts,
            ids: IdSequence::seeded(),
            survey_time: SocketOptions::default().survey_time,
            recv_buffer: DEFAULT_BUFFER,
        }
    }

    /// Whether `ctx` has a survey accepting answers.
    pub fn in_survey(&self, ctx: ContextId) -> bool {
        self.contexts.get(&ctx).is_some_and(|c| c.survey.is_some())
    }
}

impl Pattern for Surveyor {
    fn add_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) -> bool {
        self.pipes.add(pipe);
        true
    }

    fn remove_pipe(&mut self, pipe: PipeId, _fx: &mut Effects) {
        self.pipes.remove(pipe);
    }

    fn open_context(&mut self, ctx: ContextId) -> Result<()> {
        self.contexts.insert(ctx, SurveyContext::default());
        Ok(())
    }

    fn close_context(&mut self, ctx: ContextId, _fx: &mut Effects) {
        self.contexts.remove(&ctx);
    }

    fn send(&mut self, ctx: ContextId, mut msg: Message, fx: &mut Effects) -> Result<SendOutcome> {
        let context = self.contexts.get_mut(&ctx).ok_or(WeaveError::Closed)?;
        let id = self.ids.next_id();
        context.survey = Some(id);
        context.answers.clear();

        msg.backtrace_mut().clear();
        msg.push_id(id);
        msg.set_pipe(None);
        trace!("[SURVEYOR] survey {:#x} to {} pipes", id, self.pipes.len());
        for pipe in self.pipes.writable() {
            fx.transmit(pipe, msg.clone());
        }
        fx.schedule(
            self.survey_time,
            TimerToken {
                ctx,
                kind: TimerKind::SurveyEnd,
                id,
            },
        );
        Ok(SendOutcome::Sent)
    }

    fn recv(&mut self, scope: RecvScope, _fx: &mut Effects) -> Result<Poll<Message>> {
        let context = self.contexts.get_mut(&scope.ctx).ok_or(WeaveError::Closed)?;
        if context.survey.is_none() {
            return Err(WeaveError::bad_state("no survey in progress"));
        }
        Ok(context.answers.pop_front().map_or(Poll::Pending, Poll::Ready))
    }

    fn deliver(&mut self, pipe: PipeId, msg: Message, _fx: &mut Effects) {
        let Some(id) = msg.request_id() else {
            return;
        };
        match self.contexts.values_mut().find(|c| c.survey == Some(id)) {
            Some(context) if context.answers.len() >= self.recv_buffer => {
                trace!("[SURVEYOR] answer {:#x} from {} dropped, queue full", id, pipe);
            }
            Some(context) => context.answers.push_back(strip_headers(msg)),
            None => trace!("[SURVEYOR] late answer {:#x} from {} dropped", id, pipe),
        }
    }

    fn on_timer(&mut self, token: TimerToken, fx: &mut Effects) {
        if token.kind != TimerKind::SurveyEnd {
            return;
        }
        let Some(context) = self.contexts.get_mut(&token.ctx) else {
            return;
        };
        if context.survey == Some(token.id) {
            debug!("[SURVEYOR] survey {:#x} expired", token.id);
            context.survey = None;
            context.answers.clear();
            fx.fail_recv(token.ctx, WeaveError::Timeout);
        }
    }

    fn apply_options(&mut self, options: &SocketOptions) {
        self.survey_time = options.survey_time;
        self.recv_buffer = options.recv_buffer;
    }

    fn set_writable(&mut self, pipe: PipeId, writable: bool, _fx: &mut Effects) {
        self.pipes.set_writable(pipe, writable);
    }

    fn unrecv(&mut self, scope: RecvScope, msg: Message) {
        match self.contexts.get_mut(&scope.ctx) {
            Some(context) if context.survey.is_some() => context.answers.push_front(msg),
            _ => trace!("[SURVEYOR] survey over, returned answer dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::pipe;
    use crate::protocol::Effect;
    use nanoweave_core::error::ErrorKind;

    const MAIN: ContextId = ContextId::IMPLICIT;

    fn start(surveyor: &mut Surveyor) -> (TimerToken, Vec<(PipeId, Message)>) {
        let mut fx = Effects::new();
        surveyor.send(MAIN, Message::from("what time is it"), &mut fx).unwrap();
        let mut token = None;
        let mut sent = Vec::new();
        for effect in fx.drain() {
            match effect {
                Effect::Transmit { pipe, msg } => sent.push((pipe, msg)),
                Effect::Schedule { token: t, after } => {
                    assert_eq!(after, Duration::from_secs(1));
                    token = Some(t);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        (token.unwrap(), sent)
    }

    fn answer(survey: &Message, body: &'static str) -> Message {
        let mut msg = Message::from(body);
        msg.set_backtrace(survey.backtrace().into());
        msg
    }

    #[test]
    fn test_recv_without_survey() {
        let mut surveyor = Surveyor::new();
        let err = surveyor
            .recv(RecvScope::context(MAIN), &mut Effects::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadState);
    }

    #[test]
    fn test_collects_answers_until_deadline() {
        let mut fx = Effects::new();
        let mut surveyor = Surveyor::new();
        surveyor.add_pipe(pipe(1), &mut fx);
        surveyor.add_pipe(pipe(2), &mut fx);

        let (token, sent) = start(&mut surveyor);
        assert_eq!(sent.len(), 2);

        surveyor.deliver(pipe(1), answer(&sent[0].1, "noon"), &mut fx);
        surveyor.deliver(pipe(2), answer(&sent[1].1, "midnight"), &mut fx);
        let scope = RecvScope::context(MAIN);
        assert!(surveyor.recv(scope, &mut fx).unwrap().is_ready());
        assert!(surveyor.recv(scope, &mut fx).unwrap().is_ready());
        assert!(surveyor.recv(scope, &mut fx).unwrap().is_pending());

        surveyor.on_timer(token, &mut fx);
        assert!(matches!(
            fx.pop(),
            Some(Effect::FailRecv { error: WeaveError::Timeout, .. })
        ));
        assert!(!surveyor.in_survey(MAIN));
        let err = surveyor.recv(scope, &mut fx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadState);

        // Late answer is discarded
        surveyor.deliver(pipe(1), answer(&sent[0].1, "too late"), &mut fx);
        let (_, _) = start(&mut surveyor);
        assert!(surveyor.recv(scope, &mut fx).unwrap().is_pending());
    }

    #[test]
    fn test_new_survey_abandons_old() {
        let mut fx = Effects::new();
        let mut surveyor = Surveyor::new();
        surveyor.add_pipe(pipe(1), &mut fx);

        let (first_token, first) = start(&mut surveyor);
        let (_, _second) = start(&mut surveyor);

        surveyor.deliver(pipe(1), answer(&first[0].1, "old"), &mut fx);
        assert!(surveyor.recv(RecvScope::context(MAIN), &mut fx).unwrap().is_pending());

        // The old survey's timer no longer applies
        surveyor.on_timer(first_token, &mut fx);
        assert!(fx.is_empty());
        assert!(surveyor.in_survey(MAIN));
    }

    #[test]
    fn test_answer_queue_is_bounded() {
        let mut fx = Effects::new();
        let mut surveyor = Surveyor::new();
        surveyor.apply_options(&SocketOptions::new().with_recv_buffer(1));
        surveyor.add_pipe(pipe(1), &mut fx);
        surveyor.add_pipe(pipe(2), &mut fx);
        surveyor.set_writable(pipe(2), false, &mut fx);

        let (_, sent) = start(&mut surveyor);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, pipe(1));

        surveyor.deliver(pipe(1), answer(&sent[0].1, "first"), &mut fx);
        surveyor.deliver(pipe(1), answer(&sent[0].1, "second"), &mut fx);
        let scope = RecvScope::context(MAIN);
        let Poll::Ready(first) = surveyor.recv(scope, &mut fx).unwrap() else {
            panic!("answer not ready");
        };
        assert_eq!(first.as_bytes(), b"first");
        assert!(surveyor.recv(scope, &mut fx).unwrap().is_pending());

        surveyor.unrecv(scope, first);
        assert!(surveyor.recv(scope, &mut fx).unwrap().is_ready());
    }
}
