use nanoweave_core::error::Result;
use nanoweave_core::options::SocketOptions;
use nanoweave_core::transport::Engine;

typed_socket! {
    /// Exclusive one-to-one socket. A second peer is refused.
    Pair0 => Pair0
}

typed_socket! {
    /// One-to-one socket that can also run polyamorous, keeping many
    /// peers and addressing each through its [`Pipe`](crate::Pipe).
    Pair1 => Pair1
}

impl Pair1 {
    /// Open with polyamorous mode already enabled.
    pub fn open_polyamorous(engine: &Engine) -> Result<Self> {
        Self::with_options(engine, SocketOptions::default().with_polyamorous(true))
    }

    /// Whether this socket accepts many peers.
    pub fn is_polyamorous(&self) -> bool {
        self.options().polyamorous
    }
}
