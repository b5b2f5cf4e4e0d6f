//! Message type carried by sockets, contexts and pipes.
//!
//! A [`Message`] is payload bytes plus the protocol header fields a state
//! machine needs: an optional pub/sub topic, the request/survey id backtrace
//! and the pipe the message arrived on (or must leave through).

use bytes::Bytes;
use smallvec::SmallVec;

use crate::ids::PipeId;

/// Request and survey ids carry this bit; hop ids never do.
pub const ID_FLAG: u32 = 0x8000_0000;

/// Stack of backtrace ids (request or survey id on top).
pub type Backtrace = SmallVec<[u32; 4]>;

/// A discrete message.
///
/// # Examples
///
/// ```
/// use nanoweave_core::message::Message;
///
/// let msg = Message::from("hello");
/// assert_eq!(msg.as_bytes(), b"hello");
///
/// let msg = Message::with_topic("beep", "boop");
/// assert_eq!(msg.filter_key(), b"beep");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    body: Bytes,
    topic: Option<Bytes>,
    backtrace: Backtrace,
    pipe: Option<PipeId>,
}

impl Message {
    /// Create a message with the given body.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Create a message with an explicit topic property.
    #[must_use]
    pub fn with_topic(topic: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            topic: Some(topic.into()),
            ..Self::default()
        }
    }

    /// Address this message to a specific pipe.
    #[must_use]
    pub fn to_pipe(mut self, pipe: PipeId) -> Self {
        self.pipe = Some(pipe);
        self
    }

    /// Payload bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    #[must_use]
    pub fn topic(&self) -> Option<&Bytes> {
        self.topic.as_ref()
    }

    pub fn set_topic(&mut self, topic: impl Into<Bytes>) {
        self.topic = Some(topic.into());
    }

    /// Bytes a subscriber filters on: the topic if present, else the body.
    #[must_use]
    pub fn filter_key(&self) -> &[u8] {
        self.topic.as_deref().unwrap_or(&self.body)
    }

    #[must_use]
    pub fn backtrace(&self) -> &[u32] {
        &self.backtrace
    }

    pub fn backtrace_mut(&mut self) -> &mut Backtrace {
        &mut self.backtrace
    }

    /// Replace the whole backtrace.
    pub fn set_backtrace(&mut self, backtrace: Backtrace) {
        self.backtrace = backtrace;
    }

    /// Take the backtrace, leaving it empty.
    pub fn take_backtrace(&mut self) -> Backtrace {
        std::mem::take(&mut self.backtrace)
    }

    /// Push a request or survey id (the flag bit is forced on).
    pub fn push_id(&mut self, id: u32) {
        self.backtrace.push(id | ID_FLAG);
    }

    /// The request or survey id on top of the backtrace, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u32> {
        self.backtrace.last().copied().filter(|id| id & ID_FLAG != 0)
    }

    #[inline]
    #[must_use]
    pub fn pipe(&self) -> Option<PipeId> {
        self.pipe
    }

    pub fn set_pipe(&mut self, pipe: Option<PipeId>) {
        self.pipe = pipe;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

impl From<Bytes> for Message {
    fn from(body: Bytes) -> Self {
        Self::new(body)
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

impl From<&'static [u8]> for Message {
    fn from(body: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(body))
    }
}

impl<const N: usize> From<&'static [u8; N]> for Message {
    fn from(body: &'static [u8; N]) -> Self {
        Self::new(Bytes::from_static(body))
    }
}

impl From<&'static str> for Message {
    fn from(body: &'static str) -> Self {
        Self::new(Bytes::from_static(body.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(body: String) -> Self {
        Self::new(body)
    }
}

impl From<Message> for Bytes {
    fn from(msg: Message) -> Self {
        msg.body
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(Message::from(b"abc").as_bytes(), b"abc");
        assert_eq!(Message::from(vec![1u8, 2]).len(), 2);
        assert_eq!(Message::from(String::from("x")).as_bytes(), b"x");
        assert!(Message::default().is_empty());
    }

    #[test]
    fn test_filter_key_prefers_topic() {
        let plain = Message::from("beep boop");
        assert_eq!(plain.filter_key(), b"beep boop");

        let mut tagged = Message::from("payload");
        tagged.set_topic("beep");
        assert_eq!(tagged.filter_key(), b"beep");
        assert_eq!(tagged.as_bytes(), b"payload");
    }

    #[test]
    fn test_request_id_flag() {
        let mut msg = Message::from("req");
        assert_eq!(msg.request_id(), None);

        msg.push_id(5);
        assert_eq!(msg.request_id(), Some(5 | ID_FLAG));

        msg.backtrace_mut().push(3);
        assert_eq!(msg.request_id(), None);

        let bt = msg.take_backtrace();
        assert_eq!(bt.len(), 2);
        assert!(msg.backtrace().is_empty());
    }

    #[test]
    fn test_to_pipe() {
        let msg = Message::from("x").to_pipe(PipeId::from_raw(9));
        assert_eq!(msg.pipe(), Some(PipeId::from_raw(9)));
    }
}
