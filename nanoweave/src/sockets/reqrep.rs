typed_socket! {
    /// Requester. Each request gets exactly one reply; use contexts for
    /// several outstanding requests.
    Req0 => Req0
}

typed_socket! {
    /// Responder. Replies go back on the pipe the request came from.
    Rep0 => Rep0
}
