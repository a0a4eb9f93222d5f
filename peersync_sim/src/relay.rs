//! In-process relay: assigns ids, collects updates, broadcasts snapshots.
//!
//! Stands in for the server side of the protocol. Nothing happens between
//! calls to `step`, so the caller fully controls delivery order.

use crate::transport::{LinkId, SimLinkController, SimTransport, Uplink};
use peersync_core::{Cadence, InboundEvent, SnapshotBatch, SnapshotMessage, UpdateMessage, EVENT_UPDATE};
use peersync_env::{EventEnvelope, PeerId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay behavior knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interval between `clients` broadcasts
    pub broadcast_period_ms: u64,

    /// Probability that `p` (and, independently, `q`) is left out of an entry
    pub field_drop_rate: f64,

    /// Uplink delay applied to every update
    pub base_latency_ms: u64,

    /// Standard deviation of extra uplink delay
    pub latency_jitter_ms: f64,

    /// Seed for id assignment and fault decisions
    pub seed: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broadcast_period_ms: 100,
            field_drop_rate: 0.0,
            base_latency_ms: 0,
            latency_jitter_ms: 0.0,
            seed: 0,
        }
    }
}

/// Counters kept by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayMetrics {
    pub connects: u64,
    pub disconnects: u64,
    pub updates_received: u64,
    pub updates_lost: u64,
    pub updates_applied: u64,
    pub ignored_events: u64,
    pub batches_sent: u64,
    pub removals_sent: u64,
}

struct ClientLink {
    /// Id assigned on the current (or last) connection
    id: PeerId,
    inbox: mpsc::UnboundedSender<EventEnvelope>,
    connected: Arc<AtomicBool>,
    online: bool,
    /// Last applied update, `{}` until the first one arrives
    snapshot: SnapshotMessage,
    /// Updates from one link are applied in send order
    last_delivery_ms: u64,
}

impl ClientLink {
    fn deliver(&self, envelope: EventEnvelope) {
        // A dropped receiver just means the peer is gone.
        let _ = self.inbox.send(envelope);
    }

    fn send(&self, event: &InboundEvent) {
        match event.encode() {
            Ok(envelope) => self.deliver(envelope),
            Err(e) => warn!("Relay: failed to encode '{}': {}", event.name(), e),
        }
    }
}

struct PendingUpdate {
    link: LinkId,
    id: PeerId,
    deliver_at_ms: u64,
    update: UpdateMessage,
}

/// The relay every simulated peer connects to.
pub struct SimRelay {
    config: RelayConfig,
    controller: Arc<SimLinkController>,
    links: BTreeMap<LinkId, ClientLink>,
    uplink_tx: mpsc::UnboundedSender<Uplink>,
    uplink_rx: mpsc::UnboundedReceiver<Uplink>,
    pending: Vec<PendingUpdate>,
    broadcast: Option<Cadence>,
    jitter: Option<Normal<f64>>,
    rng: ChaCha8Rng,
    next_link: LinkId,
    ids_assigned: u64,
    metrics: RelayMetrics,
}

impl SimRelay {
    pub fn new(config: RelayConfig, controller: Arc<SimLinkController>) -> Self {
        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        let jitter = if config.latency_jitter_ms > 0.0 {
            Normal::new(0.0, config.latency_jitter_ms).ok()
        } else {
            None
        };
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Self {
            config,
            controller,
            links: BTreeMap::new(),
            uplink_tx,
            uplink_rx,
            pending: Vec::new(),
            broadcast: None,
            jitter,
            rng,
            next_link: 0,
            ids_assigned: 0,
            metrics: RelayMetrics::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn controller(&self) -> Arc<SimLinkController> {
        Arc::clone(&self.controller)
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    fn assign_id(&mut self) -> PeerId {
        let id = PeerId::from_seed(self.config.seed.wrapping_mul(1_000_003).wrapping_add(self.ids_assigned));
        self.ids_assigned += 1;
        id
    }

    /// Accepts a new connection.
    ///
    /// `connect` and `id` are queued on the returned transport right away;
    /// the new peer shows up in the next broadcast with an empty snapshot.
    pub fn connect(&mut self) -> Arc<SimTransport> {
        let link = self.next_link;
        self.next_link += 1;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let transport = Arc::new(SimTransport::new(
            link,
            self.uplink_tx.clone(),
            inbox_rx,
            Arc::clone(&connected),
        ));

        let id = self.assign_id();
        let client = ClientLink {
            id: id.clone(),
            inbox: inbox_tx,
            connected,
            online: true,
            snapshot: SnapshotMessage::default(),
            last_delivery_ms: 0,
        };
        client.send(&InboundEvent::Connect);
        client.send(&InboundEvent::AssignedId(id.clone()));
        self.links.insert(link, client);
        self.metrics.connects += 1;

        info!("Relay: link {} connected as {}", link, id.short());
        transport
    }

    /// Closes a connection for good and tells everyone else.
    pub fn disconnect(&mut self, link: LinkId) -> bool {
        let Some(client) = self.links.remove(&link) else {
            return false;
        };
        client.connected.store(false, Ordering::SeqCst);
        client.send(&InboundEvent::Disconnect);
        self.pending.retain(|p| p.link != link);
        self.metrics.disconnects += 1;

        info!("Relay: link {} ({}) disconnected", link, client.id.short());
        if client.online {
            self.broadcast_removal(&client.id);
        }
        true
    }

    fn broadcast_removal(&mut self, id: &PeerId) {
        let event = InboundEvent::RemoveClient(id.clone());
        for client in self.links.values().filter(|c| c.online) {
            client.send(&event);
        }
        self.metrics.removals_sent += 1;
    }

    fn sever_link(&mut self, link: LinkId) {
        let Some(client) = self.links.get_mut(&link) else {
            return;
        };
        client.online = false;
        client.connected.store(false, Ordering::SeqCst);
        client.send(&InboundEvent::Disconnect);
        let id = client.id.clone();

        self.pending.retain(|p| p.link != link);
        self.metrics.disconnects += 1;
        warn!("Relay: link {} ({}) severed", link, id.short());
        self.broadcast_removal(&id);
    }

    fn restore_link(&mut self, link: LinkId) {
        let id = self.assign_id();
        let Some(client) = self.links.get_mut(&link) else {
            return;
        };
        let previous = std::mem::replace(&mut client.id, id.clone());
        client.online = true;
        client.snapshot = SnapshotMessage::default();
        client.connected.store(true, Ordering::SeqCst);
        client.send(&InboundEvent::Connect);
        client.send(&InboundEvent::AssignedId(id.clone()));
        self.metrics.connects += 1;

        info!("Relay: link {} restored as {} (was {})", link, id.short(), previous.short());
    }

    /// Applies sever/restore requests made through the link controller.
    fn sync_link_state(&mut self) {
        let transitions: Vec<(LinkId, bool)> = self
            .links
            .iter()
            .filter_map(|(link, client)| {
                let severed = self.controller.is_severed(&client.id);
                (severed == client.online).then_some((*link, severed))
            })
            .collect();

        for (link, severed) in transitions {
            if severed {
                self.sever_link(link);
            } else {
                self.restore_link(link);
            }
        }
    }

    fn collect_uplink(&mut self, now_ms: u64) {
        while let Ok((link, envelope)) = self.uplink_rx.try_recv() {
            let Some(client) = self.links.get_mut(&link) else {
                continue;
            };
            if !client.online || !envelope.is(EVENT_UPDATE) {
                self.metrics.ignored_events += 1;
                continue;
            }
            let update = match UpdateMessage::from_envelope(&envelope) {
                Ok(update) => update,
                Err(e) => {
                    warn!("Relay: bad update from {}: {}", client.id.short(), e);
                    self.metrics.ignored_events += 1;
                    continue;
                }
            };
            self.metrics.updates_received += 1;

            let loss = self.controller.get_loss(&client.id);
            if loss > 0.0 && self.rng.gen::<f64>() < loss {
                self.metrics.updates_lost += 1;
                continue;
            }

            let jitter_ms = match &self.jitter {
                Some(normal) => normal.sample(&mut self.rng).abs().round() as u64,
                None => 0,
            };
            let delay_ms = self.config.base_latency_ms + self.controller.get_latency(&client.id) + jitter_ms;
            let deliver_at_ms = (now_ms + delay_ms).max(client.last_delivery_ms);
            client.last_delivery_ms = deliver_at_ms;

            self.pending.push(PendingUpdate {
                link,
                id: client.id.clone(),
                deliver_at_ms,
                update,
            });
        }
    }

    fn apply_due_updates(&mut self, now_ms: u64) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.deliver_at_ms <= now_ms);
        self.pending = waiting;

        for pending in due {
            match self.links.get_mut(&pending.link) {
                Some(client) if client.online && client.id == pending.id => {
                    client.snapshot = pending.update.into();
                    self.metrics.updates_applied += 1;
                }
                _ => {}
            }
        }
    }

    /// Builds the next `clients` batch, dropping fields at the configured rate.
    fn build_batch(&mut self) -> SnapshotBatch {
        let drop_rate = self.config.field_drop_rate;
        let mut batch = SnapshotBatch::new();
        for client in self.links.values().filter(|c| c.online) {
            let mut snapshot = client.snapshot.clone();
            if drop_rate > 0.0 {
                if self.rng.gen::<f64>() < drop_rate {
                    snapshot.position = None;
                }
                if self.rng.gen::<f64>() < drop_rate {
                    snapshot.orientation = None;
                }
            }
            batch.insert(client.id.clone(), snapshot);
        }
        batch
    }

    fn broadcast_snapshots(&mut self) {
        let event = InboundEvent::Clients(self.build_batch());
        let envelope = match event.encode() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Relay: failed to encode snapshot batch: {}", e);
                return;
            }
        };
        for client in self.links.values().filter(|c| c.online) {
            client.deliver(envelope.clone());
        }
        self.metrics.batches_sent += 1;
    }

    /// Advances the relay to `now_ms` on its own monotonic clock.
    ///
    /// Returns true if a `clients` batch went out.
    pub fn step(&mut self, now_ms: u64) -> bool {
        self.sync_link_state();
        self.collect_uplink(now_ms);
        self.apply_due_updates(now_ms);

        let now = Duration::from_millis(now_ms);
        let period = Duration::from_millis(self.config.broadcast_period_ms);
        let cadence = self.broadcast.get_or_insert_with(|| Cadence::new(period, now));
        if !cadence.due(now) {
            return false;
        }

        self.broadcast_snapshots();
        debug!("Relay: broadcast #{} at {}", self.metrics.batches_sent, now_ms);
        true
    }

    /// Ids of every connected peer, sorted.
    pub fn online_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .links
            .values()
            .filter(|c| c.online)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Current id of a connected link.
    pub fn peer_of(&self, link: LinkId) -> Option<&PeerId> {
        self.links.get(&link).filter(|c| c.online).map(|c| &c.id)
    }

    /// The snapshot the relay would broadcast for `id`, before field drops.
    pub fn snapshot_of(&self, id: &PeerId) -> Option<&SnapshotMessage> {
        self.links
            .values()
            .find(|c| c.online && &c.id == id)
            .map(|c| &c.snapshot)
    }

    pub fn pending_updates(&self) -> usize {
        self.pending.len()
    }
}
