//! Simulated transport with fault injection.

use async_trait::async_trait;
use peersync_env::{EnvError, EventEnvelope, LinkController, PeerId, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Connection index on the relay. Stable across reconnects, unlike the
/// relay-assigned `PeerId`.
pub type LinkId = u64;

/// Uplink message to the relay, tagged with the sending link.
pub type Uplink = (LinkId, EventEnvelope);

/// One peer's end of a simulated relay connection.
pub struct SimTransport {
    /// Connection this transport belongs to
    link: LinkId,

    /// Sender to the relay
    uplink: mpsc::UnboundedSender<Uplink>,

    /// Receiver for relay events (behind tokio mutex for async)
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventEnvelope>>,

    /// Cleared by the relay while the link is down
    connected: Arc<AtomicBool>,
}

impl SimTransport {
    pub fn new(
        link: LinkId,
        uplink: mpsc::UnboundedSender<Uplink>,
        inbox: mpsc::UnboundedReceiver<EventEnvelope>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            link,
            uplink,
            inbox: tokio::sync::Mutex::new(inbox),
            connected,
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.link
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn emit(&self, event: EventEnvelope) -> Result<(), EnvError> {
        if !self.is_connected() {
            return Err(EnvError::Disconnected);
        }
        self.uplink
            .send((self.link, event))
            .map_err(|_| EnvError::send_failed("Relay closed"))
    }

    async fn recv(&self) -> Option<EventEnvelope> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await
    }

    fn try_recv(&self) -> Option<EventEnvelope> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Link controller for fault injection.
pub struct SimLinkController {
    /// Per-peer uplink latency in milliseconds
    link_latency: Mutex<HashMap<PeerId, u64>>,

    /// Per-peer uplink loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<PeerId, f64>>,

    /// Peers whose link is currently cut
    severed: Mutex<HashSet<PeerId>>,
}

impl SimLinkController {
    /// Creates a new link controller.
    pub fn new() -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            severed: Mutex::new(HashSet::new()),
        }
    }

    /// Checks whether a peer's link is cut.
    pub fn is_severed(&self, peer: &PeerId) -> bool {
        self.severed.lock().unwrap().contains(peer)
    }

    /// Gets the latency for a link (default 0).
    pub fn get_latency(&self, peer: &PeerId) -> u64 {
        let latencies = self.link_latency.lock().unwrap();
        *latencies.get(peer).unwrap_or(&0)
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn get_loss(&self, peer: &PeerId) -> f64 {
        let losses = self.link_loss.lock().unwrap();
        *losses.get(peer).unwrap_or(&0.0)
    }
}

impl Default for SimLinkController {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkController for SimLinkController {
    fn sever(&self, peer: &PeerId) {
        self.severed.lock().unwrap().insert(peer.clone());
    }

    fn restore(&self, peer: &PeerId) {
        self.severed.lock().unwrap().remove(peer);
    }

    fn set_link_latency(&self, peer: &PeerId, latency_ms: u64) {
        self.link_latency.lock().unwrap().insert(peer.clone(), latency_ms);
    }

    fn set_link_loss(&self, peer: &PeerId, loss_rate: f64) {
        self.link_loss.lock().unwrap().insert(peer.clone(), loss_rate.clamp(0.0, 1.0));
    }
}
