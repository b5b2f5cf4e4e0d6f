//! Engine-unique object identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a socket.
    SocketId,
    "socket"
);
define_id!(
    /// Identifies a dialer.
    DialerId,
    "dialer"
);
define_id!(
    /// Identifies a listener.
    ListenerId,
    "listener"
);
define_id!(
    /// Identifies an established pipe.
    PipeId,
    "pipe"
);
define_id!(
    /// Identifies a context within a socket.
    ContextId,
    "ctx"
);

impl ContextId {
    /// The socket's implicit context.
    pub const IMPLICIT: ContextId = ContextId(0);
}

/// Monotonic allocator handing out non-zero ids.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    /// Next raw id. Zero is skipped on wraparound.
    pub fn next_raw(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn socket(&self) -> SocketId {
        SocketId(self.next_raw())
    }

    pub fn dialer(&self) -> DialerId {
        DialerId(self.next_raw())
    }

    pub fn listener(&self) -> ListenerId {
        ListenerId(self.next_raw())
    }

    pub fn pipe(&self) -> PipeId {
        PipeId(self.next_raw())
    }

    pub fn context(&self) -> ContextId {
        ContextId(self.next_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let ids = IdAllocator::new();
        let a = ids.pipe();
        let b = ids.pipe();
        let c = ids.context();
        assert_ne!(a, b);
        assert_ne!(c, ContextId::IMPLICIT);
        assert!(a.get() > 0 && b.get() > a.get());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(PipeId::from_raw(7).to_string(), "pipe#7");
        assert_eq!(ContextId::IMPLICIT.to_string(), "ctx#0");
    }
}
