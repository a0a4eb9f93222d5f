//! Sync Session - wires publisher, registry and transport together.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       SyncSession                         │
//! │                                                           │
//! │   publish cadence ──► PosePublisher ──► Transport::emit   │
//! │                                                           │
//! │   Transport::recv ──► InboundEvent ──┬─► PosePublisher    │
//! │                                      └─► PeerRegistry     │
//! │                                                           │
//! │   frame cadence ────► PeerRegistry::advance ──► scene     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! All three inputs are handled one at a time on the task that owns the
//! session, so nothing inside needs a lock.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::protocol::InboundEvent;
use crate::publisher::{PosePublisher, PoseSource};
use crate::registry::PeerRegistry;
use crate::scene::ProxyScene;
use peersync_env::{EventEnvelope, PeerId, SyncContext, Transport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest period a `Cadence` runs at; zero would fire on every poll.
pub const MIN_CADENCE_PERIOD: Duration = Duration::from_millis(1);

/// Fixed-period deadline tracker.
///
/// Missed periods collapse into a single firing rather than a burst.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cadence {
    period: Duration,
    next: Duration,
}

impl Cadence {
    /// First firing is one period after `start`. Periods below
    /// `MIN_CADENCE_PERIOD` are raised to it.
    pub fn new(period: Duration, start: Duration) -> Self {
        let period = period.max(MIN_CADENCE_PERIOD);
        Self {
            period,
            next: start + period,
        }
    }

    /// Returns true (and schedules the next firing) if a deadline has passed.
    pub fn due(&mut self, now: Duration) -> bool {
        if now < self.next {
            return false;
        }
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
        true
    }

    pub fn next_deadline(&self) -> Duration {
        self.next
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Counters describing a session run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub frames: u64,
    pub updates_sent: u64,
    pub updates_failed: u64,
    pub events: u64,
    pub decode_errors: u64,
    pub peers: usize,
}

/// One peer's synchronization session.
///
/// Generic over context, transport and scene so the same session runs on
/// tokio against a real transport or inside the deterministic simulator.
pub struct SyncSession<Ctx, Net, S>
where
    Ctx: SyncContext,
    Net: Transport,
    S: ProxyScene,
{
    /// Environment context
    pub context: Arc<Ctx>,

    /// Transport to the relay
    pub transport: Arc<Net>,

    /// Configuration
    pub config: SyncConfig,

    publisher: PosePublisher<Net>,
    registry: PeerRegistry<S>,

    /// Last connect/disconnect seen (diagnostic only)
    connected: bool,

    frames: u64,
    events: u64,
    decode_errors: u64,
}

impl<Ctx, Net, S> SyncSession<Ctx, Net, S>
where
    Ctx: SyncContext,
    Net: Transport,
    S: ProxyScene,
{
    /// Builds a session, rejecting configs that fail `SyncConfig::validate`.
    pub fn new(context: Arc<Ctx>, transport: Arc<Net>, scene: S, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let publisher = PosePublisher::new(Arc::clone(&transport), config.publish_period());
        let registry = PeerRegistry::new(scene, &config);

        Ok(Self {
            context,
            transport,
            config,
            publisher,
            registry,
            connected: false,
            frames: 0,
            events: 0,
            decode_errors: 0,
        })
    }

    /// Decodes and handles one inbound envelope.
    pub fn handle_envelope(&mut self, envelope: &EventEnvelope) -> Result<(), SyncError> {
        self.events += 1;
        let event = match InboundEvent::decode(envelope) {
            Ok(event) => event,
            Err(e) => {
                self.decode_errors += 1;
                return Err(e.into());
            }
        };
        self.handle_event(event);
        Ok(())
    }

    /// Routes a decoded event.
    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connect => {
                self.connected = true;
                info!("[{}] Connected", self.config.name);
            }
            InboundEvent::Disconnect => {
                self.connected = false;
                warn!("[{}] Disconnected", self.config.name);
            }
            InboundEvent::AssignedId(id) => {
                if self.publisher.activate(id.clone()) {
                    self.registry.set_local_id(Some(id));
                }
            }
            InboundEvent::Clients(batch) => {
                let now_ms = self.context.wall_clock_ms();
                self.registry.on_snapshot_batch(&batch, now_ms);
            }
            InboundEvent::RemoveClient(id) => {
                self.registry.on_peer_removed(&id);
            }
        }
    }

    /// Handles every event already queued on the transport.
    ///
    /// Undecodable events are logged and skipped.
    pub fn drain_inbound(&mut self) -> usize {
        let mut handled = 0;
        while let Some(envelope) = self.transport.try_recv() {
            if let Err(e) = self.handle_envelope(&envelope) {
                warn!("[{}] Dropping '{}' event: {}", self.config.name, envelope.name, e);
            }
            handled += 1;
        }
        handled
    }

    /// One publish tick, stamped with the context's wall clock.
    pub fn publish_tick<P: PoseSource + ?Sized>(&mut self, source: &P) -> bool {
        let now_ms = self.context.wall_clock_ms();
        self.publisher.publish_tick(source, now_ms)
    }

    /// One render frame: advances every proxy by the convergence fraction.
    pub fn frame(&mut self) -> usize {
        self.frames += 1;
        self.registry.advance(self.config.convergence_fraction)
    }

    /// Runs the session loop for `run_for` or until the transport closes.
    ///
    /// Frame and publish deadlines take priority; in between, the loop waits
    /// on the transport for at most the time left to the next deadline.
    pub async fn run<P>(&mut self, source: &P, run_for: Duration) -> SessionSummary
    where
        P: PoseSource + Sync + ?Sized,
    {
        let context = Arc::clone(&self.context);
        let transport = Arc::clone(&self.transport);

        let start = context.now();
        let end = start + run_for;
        let mut frame = Cadence::new(self.config.frame_period(), start);
        let mut publish = Cadence::new(self.config.publish_period(), start);

        info!("[{}] Session loop started ({:?})", self.config.name, run_for);

        loop {
            let now = context.now();
            if now >= end {
                break;
            }
            if frame.due(now) {
                self.frame();
                continue;
            }
            if publish.due(now) {
                self.publish_tick(source);
                continue;
            }

            let deadline = frame.next_deadline().min(publish.next_deadline()).min(end);
            let wait = deadline.saturating_sub(now);

            tokio::select! {
                event = transport.recv() => match event {
                    Some(envelope) => {
                        if let Err(e) = self.handle_envelope(&envelope) {
                            warn!("[{}] Dropping '{}' event: {}", self.config.name, envelope.name, e);
                        }
                    }
                    None => {
                        info!("[{}] Transport closed", self.config.name);
                        break;
                    }
                },
                _ = context.sleep(wait) => {}
            }
        }

        let summary = self.summary();
        debug!("[{}] Session loop finished: {:?}", self.config.name, summary);
        summary
    }

    /// Releases every proxy.
    pub fn shutdown(&mut self) -> usize {
        let released = self.registry.clear();
        info!("[{}] Shut down, released {} proxies", self.config.name, released);
        released
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            frames: self.frames,
            updates_sent: self.publisher.sent(),
            updates_failed: self.publisher.failed(),
            events: self.events,
            decode_errors: self.decode_errors,
            peers: self.registry.len(),
        }
    }

    pub fn registry(&self) -> &PeerRegistry<S> {
        &self.registry
    }

    pub fn publisher(&self) -> &PosePublisher<Net> {
        &self.publisher
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.publisher.local_id()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Diagnostics overlay lines.
    pub fn latency_lines(&self) -> Vec<String> {
        self.registry.latency().lines()
    }
}
