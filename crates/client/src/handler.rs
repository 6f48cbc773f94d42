//! Callback surface the embedding application implements.

/// Events delivered by the poller thread. Implementations must tolerate
/// gaps in data streams: the transport drops frames rather than block a
/// slow consumer.
pub trait ClientHandler: Send + Sync + 'static {
    /// A websocket this client asked for is open.
    fn on_opened(&self, id: u64);

    /// A tracked websocket is gone, or the broker itself was lost.
    fn on_closed(&self, id: u64);

    /// The upstream reported an error for a tracked websocket.
    fn on_error(&self, id: u64, error: &[u8]);

    /// One upstream frame. `remaining > 0` means a fragmented message;
    /// accumulate until it reaches zero.
    fn on_data(&self, id: u64, data: &[u8], remaining: u32);

    /// The broker stopped heartbeating; every tracked id has already been
    /// delivered to [`on_closed`](Self::on_closed).
    fn on_broker_lost(&self) {}
}
