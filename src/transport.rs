//! Host-link transport collaborator interface
//!
//! A message-based transport carrying the textual command grammar plus raw
//! stream payloads. The controller polls the transport for events each loop
//! iteration instead of registering callbacks, so all protocol state stays
//! inside one owner.

/// Events surfaced by a transport poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peer connected
    Connected,
    /// The peer disconnected
    Disconnected,
    /// One inbound message (command text or stream payload bytes)
    Frame(Vec<u8>),
}

/// Transport contract consumed by the controller
pub trait Transport {
    /// Start the transport, advertising under `name`
    fn begin(&mut self, name: &str) -> bool;

    /// Check whether a peer is connected
    fn is_connected(&self) -> bool;

    /// Send bytes on the data channel
    fn send(&mut self, data: &[u8]);

    /// Send bytes on the status channel
    fn send_status(&mut self, data: &[u8]);

    /// Poll one pending event; `None` when idle. Must not block.
    fn poll(&mut self) -> Option<LinkEvent>;

    /// Run transport housekeeping (flush queues, service the stack).
    ///
    /// Called once per controller loop iteration, except while an OTA
    /// session holds the loop paused. Transports with no periodic work keep
    /// the default no-op.
    fn loop_tick(&mut self) {}

    /// Maximum payload size for a single outbound message
    fn mtu(&self) -> usize {
        128
    }
}
