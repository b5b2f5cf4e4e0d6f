//! Protocol identifiers and peer compatibility.
//!
//! Each scalability protocol has a numeric id (the same numbering the wire
//! handshakes of the protocol family use) and exactly one peer protocol.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WeaveError};

/// The closed set of supported protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Protocol {
    /// Exclusive pair, single peer
    Pair0 = 0x10,

    /// Pair with optional polyamorous mode
    Pair1 = 0x11,

    /// Publisher, broadcasts to every subscriber
    Pub0 = 0x20,

    /// Subscriber, filters by topic prefix
    Sub0 = 0x21,

    /// Requester
    Req0 = 0x30,

    /// Responder
    Rep0 = 0x31,

    /// Pipeline source, round-robins
    Push0 = 0x50,

    /// Pipeline sink
    Pull0 = 0x51,

    /// Surveyor, broadcasts a survey and collects answers
    Surveyor0 = 0x62,

    /// Respondent
    Respondent0 = 0x63,
}

impl Protocol {
    /// All protocols, in id order.
    pub const ALL: [Protocol; 10] = [
        Self::Pair0,
        Self::Pair1,
        Self::Pub0,
        Self::Sub0,
        Self::Req0,
        Self::Rep0,
        Self::Push0,
        Self::Pull0,
        Self::Surveyor0,
        Self::Respondent0,
    ];

    /// Numeric protocol id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Look up a protocol by numeric id.
    #[must_use]
    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// Get the protocol name, e.g. `"req0"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pair0 => "pair0",
            Self::Pair1 => "pair1",
            Self::Pub0 => "pub0",
            Self::Sub0 => "sub0",
            Self::Req0 => "req0",
            Self::Rep0 => "rep0",
            Self::Push0 => "push0",
            Self::Pull0 => "pull0",
            Self::Surveyor0 => "surveyor0",
            Self::Respondent0 => "respondent0",
        }
    }

    /// The protocol a peer must speak to connect to this one.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Pair0 => Self::Pair0,
            Self::Pair1 => Self::Pair1,
            Self::Pub0 => Self::Sub0,
            Self::Sub0 => Self::Pub0,
            Self::Req0 => Self::Rep0,
            Self::Rep0 => Self::Req0,
            Self::Push0 => Self::Pull0,
            Self::Pull0 => Self::Push0,
            Self::Surveyor0 => Self::Respondent0,
            Self::Respondent0 => Self::Surveyor0,
        }
    }

    /// Check if this protocol is compatible with the given peer protocol.
    #[must_use]
    pub fn is_compatible(self, peer: Protocol) -> bool {
        self.peer() == peer
    }

    /// Whether sockets of this protocol can create contexts (cooked mode).
    #[must_use]
    pub const fn supports_contexts(self) -> bool {
        matches!(
            self,
            Self::Sub0 | Self::Req0 | Self::Rep0 | Self::Surveyor0 | Self::Respondent0
        )
    }

    /// Whether this protocol is allowed to send at all.
    #[must_use]
    pub const fn can_send(self) -> bool {
        !matches!(self, Self::Sub0 | Self::Pull0)
    }

    /// Whether this protocol is allowed to receive at all.
    #[must_use]
    pub const fn can_recv(self) -> bool {
        !matches!(self, Self::Pub0 | Self::Push0)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| WeaveError::invalid_protocol(format!("unknown protocol name {s:?}")))
    }
}

/// A validated recipe for opening a socket: which protocol, cooked or raw.
///
/// Sockets cannot be created generically; every socket starts from an
/// `Opener`.
///
/// ```
/// use nanoweave_core::protocol::{Opener, Protocol};
///
/// let opener = Opener::from_id(0x30).unwrap();
/// assert_eq!(opener.protocol(), Protocol::Req0);
/// assert!(!opener.is_raw());
/// assert!(Opener::from_id(0x99).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opener {
    protocol: Protocol,
    raw: bool,
}

impl Opener {
    /// Cooked opener (full protocol state machine).
    #[must_use]
    pub const fn new(protocol: Protocol) -> Self {
        Self { protocol, raw: false }
    }

    /// Raw opener: no state machine, headers exposed to the application.
    #[must_use]
    pub const fn raw(protocol: Protocol) -> Self {
        Self { protocol, raw: true }
    }

    /// Build a cooked opener from a numeric protocol id.
    pub fn from_id(id: u16) -> Result<Self> {
        Protocol::from_id(id)
            .map(Self::new)
            .ok_or_else(|| WeaveError::invalid_protocol(format!("unknown protocol id {id:#x}")))
    }

    #[inline]
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline]
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        self.raw
    }
}

impl From<Protocol> for Opener {
    fn from(protocol: Protocol) -> Self {
        Self::new(protocol)
    }
}

impl fmt::Display for Opener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw {
            write!(f, "{} (raw)", self.protocol)
        } else {
            write!(f, "{}", self.protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Req0.to_string(), "req0");
        assert_eq!(Protocol::Surveyor0.to_string(), "surveyor0");
        assert_eq!("respondent0".parse::<Protocol>().unwrap(), Protocol::Respondent0);
        assert!("dealer".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_compatibility() {
        assert!(Protocol::Req0.is_compatible(Protocol::Rep0));
        assert!(Protocol::Rep0.is_compatible(Protocol::Req0));
        assert!(Protocol::Push0.is_compatible(Protocol::Pull0));
        assert!(Protocol::Pub0.is_compatible(Protocol::Sub0));
        assert!(Protocol::Pair1.is_compatible(Protocol::Pair1));

        // Incompatible pairs
        assert!(!Protocol::Pair0.is_compatible(Protocol::Pair1));
        assert!(!Protocol::Req0.is_compatible(Protocol::Req0));
        assert!(!Protocol::Pub0.is_compatible(Protocol::Pull0));
    }

    #[test]
    fn test_peer_is_involution() {
        for p in Protocol::ALL {
            assert_eq!(p.peer().peer(), p);
            assert_eq!(Protocol::from_id(p.id()), Some(p));
        }
    }

    #[test]
    fn test_direction_and_contexts() {
        assert!(!Protocol::Pub0.can_recv());
        assert!(!Protocol::Sub0.can_send());
        assert!(Protocol::Rep0.supports_contexts());
        assert!(!Protocol::Pair1.supports_contexts());
        assert!(!Protocol::Push0.supports_contexts());
    }

    #[test]
    fn test_opener_from_unknown_id() {
        let err = Opener::from_id(0x7777).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProtocol);
        assert!(Opener::raw(Protocol::Sub0).is_raw());
        assert_eq!(Opener::raw(Protocol::Sub0).to_string(), "sub0 (raw)");
    }
}
