//! Send/receive method families shared by `Socket` and `Context`.
//!
//! Each handle provides `core: Arc<SocketCore>` and a `context_id()`; the
//! macro stamps out the blocking, non-blocking and async variants on top.

macro_rules! impl_conversation {
    ($handle:ty) => {
        impl $handle {
            /// Send a message, waiting up to the send timeout for a peer.
            pub fn send(
                &self,
                msg: impl Into<::nanoweave_core::message::Message>,
            ) -> ::nanoweave_core::error::Result<()> {
                self.core
                    .begin_send(self.context_id(), msg.into(), $crate::waiter::Mode::Wait)
                    .wait()
            }

            /// Send without waiting; fails with `TryAgain` if the message
            /// cannot be accepted right now.
            pub fn try_send(
                &self,
                msg: impl Into<::nanoweave_core::message::Message>,
            ) -> ::nanoweave_core::error::Result<()> {
                self.core
                    .begin_send(self.context_id(), msg.into(), $crate::waiter::Mode::Poll)
                    .wait()
            }

            /// Async twin of `send`.
            pub async fn send_async(
                &self,
                msg: impl Into<::nanoweave_core::message::Message>,
            ) -> ::nanoweave_core::error::Result<()> {
                let ticket = self
                    .core
                    .begin_send(self.context_id(), msg.into(), $crate::waiter::Mode::Wait);
                ticket.wait_async().await
            }

            /// Receive a message, waiting up to the receive timeout.
            pub fn recv(&self) -> ::nanoweave_core::error::Result<::nanoweave_core::message::Message> {
                self.core
                    .begin_recv(
                        $crate::protocol::RecvScope::context(self.context_id()),
                        $crate::waiter::Mode::Wait,
                    )
                    .wait()
            }

            /// Receive without waiting; fails with `TryAgain` when nothing is
            /// ready.
            pub fn try_recv(&self) -> ::nanoweave_core::error::Result<::nanoweave_core::message::Message> {
                self.core
                    .begin_recv(
                        $crate::protocol::RecvScope::context(self.context_id()),
                        $crate::waiter::Mode::Poll,
                    )
                    .wait()
            }

            /// Async twin of `recv`.
            pub async fn recv_async(&self) -> ::nanoweave_core::error::Result<::nanoweave_core::message::Message> {
                let ticket = self.core.begin_recv(
                    $crate::protocol::RecvScope::context(self.context_id()),
                    $crate::waiter::Mode::Wait,
                );
                ticket.wait_async().await
            }
        }
    };
}
