//! Independent conversations over one socket.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use nanoweave_core::error::Result;
use nanoweave_core::ids::{ContextId, SocketId};

use crate::socket_core::SocketCore;

/// A context: private protocol state multiplexed over its socket.
///
/// Sibling contexts never see each other's requests, replies, surveys or
/// subscriptions. Closing (or dropping) a context fails its blocked
/// operations with `Closed`; closing the socket closes every context.
pub struct Context {
    core: Arc<SocketCore>,
    id: ContextId,
}

impl Context {
    pub(crate) fn new(core: Arc<SocketCore>, id: ContextId) -> Self {
        Self { core, id }
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[inline]
    pub fn socket_id(&self) -> SocketId {
        self.core.id()
    }

    #[inline]
    fn context_id(&self) -> ContextId {
        self.id
    }

    /// Release this context only. Idempotent.
    pub fn close(&self) {
        self.core.close_context(self.id);
    }

    pub fn is_open(&self) -> bool {
        self.core.is_context_open(self.id)
    }

    /// Add a topic prefix to this context's filters (sub0 only).
    pub fn subscribe(&self, prefix: impl Into<Bytes>) -> Result<()> {
        self.core.subscribe(self.id, prefix.into())
    }

    pub fn unsubscribe(&self, prefix: impl AsRef<[u8]>) -> Result<()> {
        self.core.unsubscribe(self.id, prefix.as_ref())
    }

    pub fn topics(&self) -> Result<Vec<Bytes>> {
        self.core.topics(self.id)
    }
}

impl_conversation!(Context);

impl Drop for Context {
    fn drop(&mut self) {
        self.core.close_context(self.id);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("socket", &self.core.id())
            .finish()
    }
}
