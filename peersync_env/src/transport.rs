//! Transport abstraction for PeerSync sessions.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{EventEnvelope, PeerId};

/// A reliable, ordered, message-oriented link to the relay.
///
/// Handshake and reconnection are the implementation's business; the core
/// only sees named events going out and coming in.
///
/// # Event Flow
///
/// ```text
/// Session                   Transport                    Relay
///   |                           |                          |
///   |-- emit("update", {..}) -->|------------------------->|
///   |                           |<-- "clients" {id: ..} ---|
///   |<-- recv() -> envelope ----|                          |
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues an event for delivery. Never blocks.
    ///
    /// # Returns
    /// * `Ok(())` - Event handed to the transport
    /// * `Err(EnvError::Disconnected)` - Link is down
    /// * `Err(EnvError::SendFailed)` - Immediate send failure
    fn emit(&self, event: EventEnvelope) -> Result<(), EnvError>;

    /// Receives the next inbound event.
    ///
    /// # Returns
    /// * `Some(envelope)` - An event arrived
    /// * `None` - The transport was closed (shutdown)
    async fn recv(&self) -> Option<EventEnvelope>;

    /// Returns the next inbound event if one is already queued.
    fn try_recv(&self) -> Option<EventEnvelope>;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;
}

/// Fault injection for simulated links, keyed by peer.
pub trait LinkController: Send + Sync {
    /// Cuts the link of a peer (the relay treats it as disconnected).
    fn sever(&self, peer: &PeerId);

    /// Restores a previously severed link.
    fn restore(&self, peer: &PeerId);

    /// Sets one-way latency for a peer's uplink.
    fn set_link_latency(&self, peer: &PeerId, latency_ms: u64);

    /// Sets packet loss probability for a peer's uplink (0.0 - 1.0).
    fn set_link_loss(&self, peer: &PeerId, loss_rate: f64);
}
