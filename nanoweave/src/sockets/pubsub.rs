use bytes::Bytes;
use nanoweave_core::error::Result;
use nanoweave_core::options::SocketOptions;
use nanoweave_core::transport::Engine;

typed_socket! {
    /// Publisher. Sends to every subscriber; receiving is not supported.
    Pub0 => Pub0
}

typed_socket! {
    /// Subscriber. Delivers only messages matching a subscribed prefix;
    /// with no subscription nothing is delivered.
    Sub0 => Sub0
}

impl Sub0 {
    /// Open already subscribed to `topics`.
    pub fn with_topics<I, T>(engine: &Engine, topics: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self::with_options(engine, SocketOptions::default().with_topics(topics))
    }
}
