use std::fmt;
use std::sync::Arc;

use nanoweave_core::endpoint::Endpoint;
use nanoweave_core::ids::DialerId;

use crate::socket_core::SocketCore;

/// Handle to a socket's dialer.
///
/// The socket owns the dialer; dropping this handle leaves it running.
/// While open, a dialer whose pipe is lost reconnects with backoff.
#[derive(Clone)]
pub struct Dialer {
    core: Arc<SocketCore>,
    id: DialerId,
    endpoint: Endpoint,
}

impl Dialer {
    pub(crate) fn new(core: Arc<SocketCore>, id: DialerId, endpoint: Endpoint) -> Self {
        Self { core, id, endpoint }
    }

    #[inline]
    pub fn id(&self) -> DialerId {
        self.id
    }

    pub fn address(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop dialing and close the dialer's pipe. Idempotent.
    pub fn close(&self) {
        self.core.close_dialer(self.id);
    }

    pub fn is_open(&self) -> bool {
        self.core.has_dialer(self.id)
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id)
            .field("address", &self.endpoint)
            .finish()
    }
}
