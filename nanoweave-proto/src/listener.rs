use std::fmt;
use std::sync::Arc;

use nanoweave_core::endpoint::Endpoint;
use nanoweave_core::ids::ListenerId;

use crate::socket_core::SocketCore;

/// Handle to a socket's listener.
///
/// Closing it releases the address at once and closes the pipes it
/// accepted; the address can be listened on again immediately.
#[derive(Clone)]
pub struct Listener {
    core: Arc<SocketCore>,
    id: ListenerId,
    endpoint: Endpoint,
}

impl Listener {
    pub(crate) fn new(core: Arc<SocketCore>, id: ListenerId, endpoint: Endpoint) -> Self {
        Self { core, id, endpoint }
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn address(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        self.core.close_listener(self.id);
    }

    pub fn is_open(&self) -> bool {
        self.core.has_listener(self.id)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("address", &self.endpoint)
            .finish()
    }
}
