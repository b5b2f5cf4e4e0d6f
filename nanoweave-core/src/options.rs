//! Socket configuration options
//!
//! Options exist in two shapes. [`SocketOptions`] is the typed struct with
//! `with_*` builders, used when opening a socket. The keyed layer
//! ([`OptionKey`] + [`OptionValue`]) backs `set_option`/`get_option` on a
//! live socket, where keys arrive as strings.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Result, WeaveError};
use crate::protocol::Protocol;

/// Default depth of a socket's receive queue and of each pipe's send
/// queue, in messages.
pub const DEFAULT_BUFFER: usize = 1000;

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use nanoweave_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let opts = SocketOptions::default()
///     .with_recv_timeout(Duration::from_secs(5))
///     .with_name("frontend")
///     .with_topics(["beep", "hello"]);
/// assert_eq!(opts.topics.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Receive timeout
    ///
    /// - `None`: Block indefinitely (default)
    /// - `Some(duration)`: Fail with `Timeout` after duration
    pub recv_timeout: Option<Duration>,

    /// Send timeout
    ///
    /// - `None`: Block indefinitely (default)
    /// - `Some(duration)`: Fail with `Timeout` after duration
    pub send_timeout: Option<Duration>,

    /// Free-form socket name, used in logs and monitor output.
    pub name: String,

    /// Subscription prefixes (sub0 only). Empty = nothing is delivered.
    pub topics: Vec<Bytes>,

    /// Polyamorous mode (pair1 only); must be set before dial/listen.
    pub polyamorous: bool,

    /// Default dial mode
    ///
    /// - `None`: try a blocking dial first, fall back to background
    ///   redial if nobody is listening yet (default)
    /// - `Some(true)`: dial failures are returned to the caller
    /// - `Some(false)`: never block, always redial in the background
    pub block_on_dial: Option<bool>,

    /// Initial reconnection delay after connection loss (default 100ms).
    pub reconnect_ivl: Duration,

    /// Maximum reconnection delay for exponential backoff.
    /// - Default: 0 (no growth, use `reconnect_ivl` always)
    pub reconnect_ivl_max: Duration,

    /// Request re-send interval (req0 only). `None` disables re-sending.
    pub resend_time: Option<Duration>,

    /// How long a survey accepts responses (surveyor0 only).
    pub survey_time: Duration,

    /// Receive high water mark: messages queued for the application.
    ///
    /// Lossy patterns (sub, surveyor) drop arrivals beyond it; the others
    /// stop reading their pipes until the application catches up.
    pub recv_buffer: usize,

    /// Send high water mark: messages in flight on each pipe. A full pipe
    /// is skipped by broadcasts and blocks everything else.
    pub send_buffer: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_timeout: None, // Block indefinitely
            send_timeout: None, // Block indefinitely
            name: String::new(),
            topics: Vec::new(),
            polyamorous: false,
            block_on_dial: None,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::ZERO, // No growth
            resend_time: Some(Duration::from_secs(60)),
            survey_time: Duration::from_secs(1),
            recv_buffer: DEFAULT_BUFFER,
            send_buffer: DEFAULT_BUFFER,
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set receive timeout.
    ///
    /// ```
    /// use nanoweave_core::options::SocketOptions;
    /// use std::time::Duration;
    ///
    /// let opts = SocketOptions::new().with_recv_timeout(Duration::from_millis(1));
    /// assert_eq!(opts.recv_timeout, Some(Duration::from_millis(1)));
    /// ```
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Set send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the socket name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the subscription prefixes.
    pub fn with_topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable polyamorous mode.
    pub fn with_polyamorous(mut self, enabled: bool) -> Self {
        self.polyamorous = enabled;
        self
    }

    /// Set the default dial mode.
    pub fn with_block_on_dial(mut self, block: bool) -> Self {
        self.block_on_dial = Some(block);
        self
    }

    /// Set reconnection interval.
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    /// Set maximum reconnection interval for exponential backoff.
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    /// Set (or disable with `None`) the request re-send interval.
    pub fn with_resend_time(mut self, resend: Option<Duration>) -> Self {
        self.resend_time = resend;
        self
    }

    /// Set the survey deadline.
    pub fn with_survey_time(mut self, survey: Duration) -> Self {
        self.survey_time = survey;
        self
    }

    /// Set the receive high water mark (at least one message).
    pub fn with_recv_buffer(mut self, depth: usize) -> Self {
        self.recv_buffer = depth.max(1);
        self
    }

    /// Set the per-pipe send high water mark (at least one message).
    pub fn with_send_buffer(mut self, depth: usize) -> Self {
        self.send_buffer = depth.max(1);
        self
    }

    /// Get the reconnection interval for a given attempt.
    ///
    /// Doubles per attempt up to `reconnect_ivl_max`; a zero maximum
    /// disables growth.
    pub fn next_reconnect_ivl(&self, attempt: u32) -> Duration {
        if self.reconnect_ivl_max.is_zero() {
            return self.reconnect_ivl;
        }

        let backoff = self
            .reconnect_ivl
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));

        backoff.min(self.reconnect_ivl_max)
    }

    /// Apply a keyed option. Scope checks against the protocol are done by
    /// the caller; this only validates and stores the value.
    pub fn set(&mut self, key: OptionKey, value: OptionValue) -> Result<()> {
        match key {
            OptionKey::RecvTimeout => self.recv_timeout = value.to_timeout(key)?,
            OptionKey::SendTimeout => self.send_timeout = value.to_timeout(key)?,
            OptionKey::Name => self.name = value.to_text(key)?,
            OptionKey::Topics => self.topics = value.to_list(key)?,
            OptionKey::Polyamorous => self.polyamorous = value.to_bool(key)?,
            OptionKey::BlockOnDial => self.block_on_dial = Some(value.to_bool(key)?),
            OptionKey::ReconnectIvl => self.reconnect_ivl = value.to_interval(key)?,
            OptionKey::ReconnectIvlMax => self.reconnect_ivl_max = value.to_interval(key)?,
            OptionKey::ResendTime => self.resend_time = value.to_timeout(key)?,
            OptionKey::SurveyTime => self.survey_time = value.to_interval(key)?,
            OptionKey::RecvBuffer => self.recv_buffer = value.to_depth(key)?,
            OptionKey::SendBuffer => self.send_buffer = value.to_depth(key)?,
        }
        Ok(())
    }

    /// Read a keyed option.
    pub fn get(&self, key: OptionKey) -> OptionValue {
        match key {
            OptionKey::RecvTimeout => OptionValue::Duration(self.recv_timeout),
            OptionKey::SendTimeout => OptionValue::Duration(self.send_timeout),
            OptionKey::Name => OptionValue::Str(self.name.clone()),
            OptionKey::Topics => OptionValue::List(self.topics.clone()),
            OptionKey::Polyamorous => OptionValue::Bool(self.polyamorous),
            OptionKey::BlockOnDial => OptionValue::Bool(self.block_on_dial.unwrap_or(false)),
            OptionKey::ReconnectIvl => OptionValue::Duration(Some(self.reconnect_ivl)),
            OptionKey::ReconnectIvlMax => OptionValue::Duration(Some(self.reconnect_ivl_max)),
            OptionKey::ResendTime => OptionValue::Duration(self.resend_time),
            OptionKey::SurveyTime => OptionValue::Duration(Some(self.survey_time)),
            OptionKey::RecvBuffer => OptionValue::from(self.recv_buffer),
            OptionKey::SendBuffer => OptionValue::from(self.send_buffer),
        }
    }
}

/// Names of the keyed options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    RecvTimeout,
    SendTimeout,
    Name,
    Topics,
    Polyamorous,
    BlockOnDial,
    ReconnectIvl,
    ReconnectIvlMax,
    ResendTime,
    SurveyTime,
    RecvBuffer,
    SendBuffer,
}

impl OptionKey {
    pub const ALL: [OptionKey; 12] = [
        Self::RecvTimeout,
        Self::SendTimeout,
        Self::Name,
        Self::Topics,
        Self::Polyamorous,
        Self::BlockOnDial,
        Self::ReconnectIvl,
        Self::ReconnectIvlMax,
        Self::ResendTime,
        Self::SurveyTime,
        Self::RecvBuffer,
        Self::SendBuffer,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RecvTimeout => "recv_timeout",
            Self::SendTimeout => "send_timeout",
            Self::Name => "name",
            Self::Topics => "topics",
            Self::Polyamorous => "polyamorous",
            Self::BlockOnDial => "block_on_dial",
            Self::ReconnectIvl => "reconnect_ivl",
            Self::ReconnectIvlMax => "reconnect_ivl_max",
            Self::ResendTime => "resend_time",
            Self::SurveyTime => "survey_time",
            Self::RecvBuffer => "recv_buffer",
            Self::SendBuffer => "send_buffer",
        }
    }

    /// Whether the key is meaningful for sockets of `protocol`.
    #[must_use]
    pub const fn applies_to(self, protocol: Protocol) -> bool {
        match self {
            Self::Topics => matches!(protocol, Protocol::Sub0),
            Self::Polyamorous => matches!(protocol, Protocol::Pair1),
            Self::ResendTime => matches!(protocol, Protocol::Req0),
            Self::SurveyTime => matches!(protocol, Protocol::Surveyor0),
            _ => true,
        }
    }
}

impl FromStr for OptionKey {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| WeaveError::not_supported(format!("unknown option {s:?}")))
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dynamically typed option value.
///
/// Integers given for duration options are milliseconds, with `-1`
/// meaning infinite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(String),
    /// `None` = infinite / disabled
    Duration(Option<Duration>),
    List(Vec<Bytes>),
}

impl OptionValue {
    /// Milliseconds, `-1` for infinite. `None` for non-duration values.
    #[must_use]
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Self::Duration(None) => Some(-1),
            Self::Duration(Some(d)) => Some(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            Self::Int(ms) => Some(*ms),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Bytes]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    fn mismatch(&self, key: OptionKey, expected: &str) -> WeaveError {
        WeaveError::invalid_argument(format!("option {key} expects {expected}, got {self:?}"))
    }

    fn to_timeout(&self, key: OptionKey) -> Result<Option<Duration>> {
        match self {
            Self::Duration(d) => Ok(*d),
            Self::Int(-1) => Ok(None),
            Self::Int(ms) if *ms >= 0 => Ok(Some(Duration::from_millis(ms.unsigned_abs()))),
            _ => Err(self.mismatch(key, "a duration, milliseconds or -1")),
        }
    }

    fn to_interval(&self, key: OptionKey) -> Result<Duration> {
        match self.to_timeout(key)? {
            Some(d) => Ok(d),
            None => Err(self.mismatch(key, "a finite duration")),
        }
    }

    fn to_bool(&self, key: OptionKey) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Int(0) => Ok(false),
            Self::Int(1) => Ok(true),
            _ => Err(self.mismatch(key, "a boolean")),
        }
    }

    fn to_depth(&self, key: OptionKey) -> Result<usize> {
        match self {
            Self::Int(n) if *n >= 1 => usize::try_from(*n).map_err(|_| self.mismatch(key, "a queue depth")),
            _ => Err(self.mismatch(key, "a queue depth of at least 1")),
        }
    }

    fn to_text(&self, key: OptionKey) -> Result<String> {
        match self {
            Self::Str(s) => Ok(s.clone()),
            _ => Err(self.mismatch(key, "a string")),
        }
    }

    fn to_list(&self, key: OptionKey) -> Result<Vec<Bytes>> {
        match self {
            Self::Str(s) => Ok(vec![Bytes::from(s.clone())]),
            Self::List(items) => Ok(items.clone()),
            _ => Err(self.mismatch(key, "a string or a list")),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Duration> for OptionValue {
    fn from(v: Duration) -> Self {
        Self::Duration(Some(v))
    }
}

impl From<Option<Duration>> for OptionValue {
    fn from(v: Option<Duration>) -> Self {
        Self::Duration(v)
    }
}

impl From<Vec<Bytes>> for OptionValue {
    fn from(v: Vec<Bytes>) -> Self {
        Self::List(v)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(|s| Bytes::from(s.to_string())).collect())
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v.into_iter().map(Bytes::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for OptionValue {
    fn from(v: [&str; N]) -> Self {
        Self::List(v.iter().map(|s| Bytes::from(s.to_string())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_options() {
        let opts = SocketOptions::default();
        assert!(opts.recv_timeout.is_none());
        assert!(opts.send_timeout.is_none());
        assert_eq!(opts.reconnect_ivl, Duration::from_millis(100));
        assert_eq!(opts.resend_time, Some(Duration::from_secs(60)));
        assert_eq!(opts.survey_time, Duration::from_secs(1));
        assert!(opts.topics.is_empty());
        assert_eq!(opts.block_on_dial, None);
    }

    #[test]
    fn test_builder_pattern() {
        let opts = SocketOptions::new()
            .with_recv_timeout(Duration::from_secs(5))
            .with_send_timeout(Duration::from_secs(10))
            .with_polyamorous(true)
            .with_name("worker");

        assert_eq!(opts.recv_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.send_timeout, Some(Duration::from_secs(10)));
        assert!(opts.polyamorous);
        assert_eq!(opts.name, "worker");
    }

    #[test]
    fn test_exponential_backoff() {
        let opts = SocketOptions::new()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_secs(10));

        assert_eq!(opts.next_reconnect_ivl(0), Duration::from_millis(100));
        assert_eq!(opts.next_reconnect_ivl(1), Duration::from_millis(200));
        assert_eq!(opts.next_reconnect_ivl(2), Duration::from_millis(400));
        assert_eq!(opts.next_reconnect_ivl(10), Duration::from_secs(10));
    }

    #[test]
    fn test_no_exponential_backoff() {
        let opts = SocketOptions::new().with_reconnect_ivl(Duration::from_millis(100));
        assert_eq!(opts.next_reconnect_ivl(0), Duration::from_millis(100));
        assert_eq!(opts.next_reconnect_ivl(5), Duration::from_millis(100));
    }

    #[test]
    fn test_keyed_timeouts() {
        let mut opts = SocketOptions::new();
        opts.set(OptionKey::RecvTimeout, 1.into()).unwrap();
        assert_eq!(opts.recv_timeout, Some(Duration::from_millis(1)));
        assert_eq!(opts.get(OptionKey::RecvTimeout).as_millis(), Some(1));

        opts.set(OptionKey::RecvTimeout, (-1).into()).unwrap();
        assert_eq!(opts.recv_timeout, None);
        assert_eq!(opts.get(OptionKey::RecvTimeout).as_millis(), Some(-1));

        let err = opts.set(OptionKey::SendTimeout, (-7).into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = opts.set(OptionKey::SurveyTime, (-1).into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_keyed_topics_and_name() {
        let mut opts = SocketOptions::new();
        opts.set(OptionKey::Topics, "beep".into()).unwrap();
        assert_eq!(opts.topics, vec![Bytes::from_static(b"beep")]);

        opts.set(OptionKey::Topics, ["beep", "hello"].into()).unwrap();
        assert_eq!(opts.topics.len(), 2);

        opts.set(OptionKey::Name, "hello".into()).unwrap();
        assert_eq!(opts.get(OptionKey::Name).as_str(), Some("hello"));

        let err = opts.set(OptionKey::Name, true.into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_keyed_buffers() {
        let mut opts = SocketOptions::new();
        assert_eq!(opts.get(OptionKey::RecvBuffer).as_int(), Some(DEFAULT_BUFFER as i64));

        opts.set(OptionKey::SendBuffer, 16_i64.into()).unwrap();
        assert_eq!(opts.send_buffer, 16);
        opts.set(OptionKey::RecvBuffer, 1_i64.into()).unwrap();
        assert_eq!(opts.get(OptionKey::RecvBuffer).as_int(), Some(1));

        for bad in [OptionValue::from(0_i64), OptionValue::from(-1_i64), OptionValue::from("many")] {
            let err = opts.set(OptionKey::RecvBuffer, bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(SocketOptions::new().with_send_buffer(0).send_buffer, 1);
    }

    #[test]
    fn test_unknown_key() {
        let err = "linger".parse::<OptionKey>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!("survey_time".parse::<OptionKey>().unwrap(), OptionKey::SurveyTime);
    }

    #[test]
    fn test_key_scope() {
        assert!(OptionKey::Topics.applies_to(Protocol::Sub0));
        assert!(!OptionKey::Topics.applies_to(Protocol::Pub0));
        assert!(OptionKey::Polyamorous.applies_to(Protocol::Pair1));
        assert!(!OptionKey::Polyamorous.applies_to(Protocol::Pair0));
        assert!(OptionKey::Name.applies_to(Protocol::Push0));
    }
}
