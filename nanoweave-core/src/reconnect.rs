//! Reconnection backoff for dialers.

use std::time::Duration;
use crate::options::SocketOptions;

/// Reconnection state tracker for managing connection attempts and backoff.
///
/// The delay doubles with each failed attempt up to `reconnect_ivl_max`;
/// a zero maximum keeps the delay at `reconnect_ivl`.
///
/// # Example
///
/// ```rust
/// use nanoweave_core::reconnect::ReconnectState;
/// use nanoweave_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let options = SocketOptions::default()
///     .with_reconnect_ivl(Duration::from_millis(100))
///     .with_reconnect_ivl_max(Duration::from_secs(10));
///
/// let mut reconnect = ReconnectState::new(&options);
///
/// // First attempt uses base interval
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
///
/// // Subsequent attempts use exponential backoff
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(200));
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(400));
///
/// // Reset on successful connection
/// reconnect.reset();
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_interval: Duration,
    max_interval: Duration,
    /// Failed attempts since the last reset
    attempt: u32,
}

impl ReconnectState {
    /// Create a new reconnection state tracker from socket options.
    pub const fn new(options: &SocketOptions) -> Self {
        Self {
            base_interval: options.reconnect_ivl,
            max_interval: options.reconnect_ivl_max,
            attempt: 0,
        }
    }

    /// Get the delay for the next reconnection attempt and count it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// The delay `next_delay` would return, without counting an attempt.
    #[must_use]
    pub fn peek_delay(&self) -> Duration {
        if self.max_interval.is_zero() {
            return self.base_interval;
        }
        self.base_interval
            .saturating_mul(1_u32 << self.attempt.min(16))
            .min(self.max_interval)
    }

    /// Reset the reconnection state after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Pick up changed intervals without losing the attempt count.
    pub fn update(&mut self, options: &SocketOptions) {
        self.base_interval = options.reconnect_ivl;
        self.max_interval = options.reconnect_ivl_max;
    }

    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    #[must_use]
    pub const fn base_interval(&self) -> Duration {
        self.base_interval
    }

    #[inline]
    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        self.max_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let options = SocketOptions::default()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_secs(10));

        let mut state = ReconnectState::new(&options);

        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));
        assert_eq!(state.next_delay(), Duration::from_millis(800));
        assert_eq!(state.attempt(), 4);
    }

    #[test]
    fn test_max_interval_cap() {
        let options = SocketOptions::default()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_millis(500));

        let mut state = ReconnectState::new(&options);

        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));

        // Should be capped at max
        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_max_means_fixed_interval() {
        let options = SocketOptions::default().with_reconnect_ivl(Duration::from_millis(50));
        let mut state = ReconnectState::new(&options);

        for _ in 0..5 {
            assert_eq!(state.next_delay(), Duration::from_millis(50));
        }
        assert_eq!(state.attempt(), 5);
    }

    #[test]
    fn test_reset_and_update() {
        let options = SocketOptions::default()
            .with_reconnect_ivl(Duration::from_millis(100))
            .with_reconnect_ivl_max(Duration::from_secs(10));

        let mut state = ReconnectState::new(&options);
        state.next_delay();
        state.next_delay();
        assert_eq!(state.peek_delay(), Duration::from_millis(400));

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.peek_delay(), Duration::from_millis(100));

        state.update(&options.clone().with_reconnect_ivl(Duration::from_millis(10)));
        assert_eq!(state.base_interval(), Duration::from_millis(10));
        assert_eq!(state.max_interval(), Duration::from_secs(10));
    }
}
