typed_socket! {
    /// Pipeline source. Each message goes to one pull peer, round robin.
    Push0 => Push0
}

typed_socket! {
    /// Pipeline sink. Receives in arrival order from every push peer.
    Pull0 => Pull0
}
