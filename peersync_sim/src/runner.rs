//! Scenario runner - plays scenario scripts against a relay and a set of
//! simulated peers, then checks what every peer ended up seeing.

use crate::context::SimContext;
use crate::exporter::{ObserverFrame, PeerPosition, SimEvent, SimExport, SimFrame};
use crate::motion::{OrbitPath, OrbitSource};
use crate::relay::{RelayConfig, RelayMetrics, SimRelay};
use crate::scenarios::{ScenarioId, ScenarioPlan, ScriptAction};
use crate::scene::RecordingScene;
use crate::transport::{SimLinkController, SimTransport};

use peersync_core::{Cadence, PoseSource, SyncConfig, SyncSession};
use peersync_env::{LinkController, PeerId, SyncContext};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of connected peers at end
    pub final_peer_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Updates handed to the transport, all peers
    pub updates_sent: u64,

    /// Updates refused by the transport
    pub updates_failed: u64,

    /// Inbound events that did not decode
    pub decode_errors: u64,

    pub proxies_spawned: u64,
    pub proxies_despawned: u64,

    /// Relay-side counters
    pub relay: RelayMetrics,

    /// Proxy position error vs. the owner's true position at the end
    pub rms_error_m: Option<f64>,
    pub max_error_m: f64,

    /// Mean of every observer's smoothed latency
    pub mean_latency_ms: f64,
    pub max_latency_ms: i64,
}

type PeerSession = SyncSession<SimContext, SimTransport, RecordingScene>;

/// One simulated participant.
struct SimPeer {
    index: usize,
    session: PeerSession,
    source: OrbitSource<SimContext>,
    publish: Cadence,
    frame: Cadence,
    /// Every id this peer was assigned, in order
    ids: Vec<PeerId>,
    /// Ids it should have gone through by the end
    expected_ids: usize,
    left: bool,
    severed_as: Option<PeerId>,
}

impl SimPeer {
    fn name(&self) -> &str {
        &self.session.config.name
    }

    fn current_id(&self) -> Option<&PeerId> {
        self.session.local_id()
    }

    fn tick(&mut self, now: Duration) {
        self.session.drain_inbound();
        if let Some(id) = self.session.local_id() {
            if self.ids.last() != Some(id) {
                self.ids.push(id.clone());
            }
        }
        if self.publish.due(now) {
            self.session.publish_tick(&self.source);
        }
        if self.frame.due(now) {
            self.session.frame();
        }
    }
}

struct Evaluation {
    failures: Vec<String>,
    rms_error: Option<f64>,
    max_error: f64,
}

/// Relay, peers, and the fault injector sharing one virtual clock.
struct World {
    context: Arc<SimContext>,
    relay: SimRelay,
    controller: Arc<SimLinkController>,
    peers: Vec<SimPeer>,
    paths_rng: ChaCha8Rng,
    sync: SyncConfig,
    /// Ids that left or were cut off
    departed: Vec<PeerId>,
}

impl World {
    fn new(seed: u64, plan: &ScenarioPlan, sync: SyncConfig) -> Self {
        let context = SimContext::shared(seed);
        let controller = Arc::new(SimLinkController::new());
        let relay_config = RelayConfig {
            seed: seed.wrapping_mul(0x9e3779b97f4a7c15),
            ..plan.relay.clone()
        };
        let relay = SimRelay::new(relay_config, Arc::clone(&controller));

        Self {
            context,
            relay,
            controller,
            peers: Vec::new(),
            paths_rng: ChaCha8Rng::seed_from_u64(seed ^ 0x5851f42d4c957f2d),
            sync,
            departed: Vec::new(),
        }
    }

    fn join(&mut self) -> SimEvent {
        let index = self.peers.len();
        let now = self.context.now();
        let transport = self.relay.connect();
        let config = SyncConfig {
            name: format!("peer-{}", index),
            ..self.sync.clone()
        };
        let path = OrbitPath::random(&mut self.paths_rng);
        let source = OrbitSource::new(Arc::clone(&self.context), path);
        let link = transport.link_id();
        let session = match SyncSession::new(Arc::clone(&self.context), transport, RecordingScene::new(), config) {
            Ok(session) => session,
            Err(e) => {
                self.relay.disconnect(link);
                return SimEvent::warn(format!("peer-{} rejected: {}", index, e));
            }
        };

        self.peers.push(SimPeer {
            index,
            session,
            source,
            publish: Cadence::new(self.sync.publish_period(), now),
            frame: Cadence::new(self.sync.frame_period(), now),
            ids: Vec::new(),
            expected_ids: 1,
            left: false,
            severed_as: None,
        });

        info!("  + peer-{} joined at t={:.2}s", index, now.as_secs_f64());
        SimEvent::info(format!("peer-{} joined", index))
    }

    fn active(&self, index: usize) -> Option<&SimPeer> {
        self.peers.get(index).filter(|p| !p.left)
    }

    fn leave(&mut self, index: usize) -> SimEvent {
        let Some(peer) = self.peers.get_mut(index).filter(|p| !p.left) else {
            warn!("  peer-{} cannot leave, not connected", index);
            return SimEvent::warn(format!("peer-{} cannot leave", index));
        };
        peer.left = true;
        let id = peer.current_id().cloned();
        let link = peer.session.transport.link_id();
        peer.session.shutdown();

        self.relay.disconnect(link);
        self.departed.extend(id);
        info!("  - peer-{} left at t={:.2}s", index, self.context.now().as_secs_f64());
        SimEvent::info(format!("peer-{} left", index))
    }

    fn leave_random(&mut self) -> SimEvent {
        let candidates: Vec<usize> = self
            .peers
            .iter()
            .filter(|p| !p.left && p.severed_as.is_none())
            .map(|p| p.index)
            .collect();
        if candidates.is_empty() {
            return SimEvent::warn("nobody left to remove");
        }
        let pick = self.context.with_rng(|rng| rng.gen_range(0..candidates.len()));
        self.leave(candidates[pick])
    }

    fn sever(&mut self, index: usize) -> SimEvent {
        let Some(id) = self.active(index).and_then(|p| p.current_id().cloned()) else {
            return SimEvent::warn(format!("peer-{} has no link to sever", index));
        };
        self.controller.sever(&id);
        self.departed.push(id.clone());
        if let Some(peer) = self.peers.get_mut(index) {
            peer.severed_as = Some(id);
        }
        warn!("  ⚡ peer-{} link severed at t={:.2}s", index, self.context.now().as_secs_f64());
        SimEvent::warn(format!("peer-{} severed", index))
    }

    fn restore(&mut self, index: usize) -> SimEvent {
        let Some(peer) = self.peers.get_mut(index) else {
            return SimEvent::warn(format!("peer-{} does not exist", index));
        };
        let Some(id) = peer.severed_as.take() else {
            return SimEvent::warn(format!("peer-{} was not severed", index));
        };
        peer.expected_ids += 1;
        self.controller.restore(&id);
        info!("  ✓ peer-{} link restored at t={:.2}s", index, self.context.now().as_secs_f64());
        SimEvent::info(format!("peer-{} restored", index))
    }

    fn with_link(&self, index: usize, f: impl FnOnce(&SimLinkController, &PeerId)) -> SimEvent {
        match self.active(index).and_then(|p| p.current_id()) {
            Some(id) => {
                f(&self.controller, id);
                SimEvent::info(format!("peer-{} link reconfigured", index))
            }
            None => SimEvent::warn(format!("peer-{} has no link", index)),
        }
    }

    fn apply(&mut self, action: &ScriptAction) -> SimEvent {
        match action {
            ScriptAction::Join => self.join(),
            ScriptAction::Leave(index) => self.leave(*index),
            ScriptAction::LeaveRandom => self.leave_random(),
            ScriptAction::Sever(index) => self.sever(*index),
            ScriptAction::Restore(index) => self.restore(*index),
            ScriptAction::SetLinkLatency(index, ms) => {
                self.with_link(*index, |c, id| c.set_link_latency(id, *ms))
            }
            ScriptAction::SetLinkLoss(index, rate) => {
                self.with_link(*index, |c, id| c.set_link_loss(id, *rate))
            }
        }
    }

    fn step(&mut self, now: Duration) {
        self.relay.step(now.as_millis() as u64);
        for peer in self.peers.iter_mut().filter(|p| !p.left) {
            peer.tick(now);
        }
    }

    fn online(&self) -> impl Iterator<Item = &SimPeer> {
        self.peers.iter().filter(|p| !p.left)
    }

    fn frame(&self, events: Vec<SimEvent>) -> SimFrame {
        let mut ground_truth = Vec::new();
        let mut observers = Vec::new();

        for peer in self.online() {
            let Some(id) = peer.current_id() else {
                continue;
            };
            ground_truth.push(PeerPosition::new(id.short(), &peer.source.current_pose().position));
            observers.push(ObserverFrame {
                observer: id.short().to_string(),
                proxies: peer
                    .session
                    .registry()
                    .proxies()
                    .map(|(peer_id, pose, _)| PeerPosition::new(peer_id.short(), &pose.position))
                    .collect(),
                latency: peer.session.latency_lines(),
            });
        }

        SimFrame {
            time_sec: self.context.now().as_secs_f64(),
            ground_truth,
            observers,
            events,
        }
    }

    /// Checks membership, scene bookkeeping and proxy accuracy for every
    /// connected peer.
    fn evaluate(&self, plan: &ScenarioPlan) -> Evaluation {
        let online_ids = self.relay.online_peers();
        let owners: HashMap<&PeerId, &SimPeer> = self
            .online()
            .filter_map(|p| p.current_id().map(|id| (id, p)))
            .collect();
        let max_speed = owners
            .values()
            .map(|p| p.source.path().max_speed())
            .fold(0.0, f64::max);

        let mut failures = Vec::new();
        let mut squared = 0.0;
        let mut scored = 0usize;
        let mut max_error: f64 = 0.0;

        for peer in self.online() {
            let name = peer.name();
            let Some(me) = peer.current_id() else {
                failures.push(format!("{} never got an id", name));
                continue;
            };
            if self.relay.peer_of(peer.session.transport.link_id()) != Some(me) {
                failures.push(format!("{} holds stale id {}", name, me.short()));
            }
            if peer.ids.len() != peer.expected_ids {
                failures.push(format!(
                    "{} went through {} ids, expected {}",
                    name,
                    peer.ids.len(),
                    peer.expected_ids
                ));
            }

            let registry = peer.session.registry();
            let expected: Vec<PeerId> = online_ids.iter().filter(|id| *id != me).cloned().collect();
            let seen = registry.ids();
            if seen != expected {
                failures.push(format!("{} sees {} peers, expected {}", name, seen.len(), expected.len()));
            }

            let scene = registry.scene();
            if !scene.is_consistent() || scene.live_count() != registry.len() {
                failures.push(format!(
                    "{} scene out of sync ({} proxies for {} peers)",
                    name,
                    scene.live_count(),
                    registry.len()
                ));
            }
            for gone in &self.departed {
                if registry.contains(gone) || scene.spawns_of(gone) != scene.despawns_of(gone) {
                    failures.push(format!("{} still shows departed {}", name, gone.short()));
                }
            }

            let summary = peer.session.summary();
            if summary.decode_errors > 0 {
                failures.push(format!("{} failed to decode {} events", name, summary.decode_errors));
            }

            for (id, pose, _) in registry.proxies() {
                if let Some(owner) = owners.get(id) {
                    let error = pose.distance_to(&owner.source.current_pose());
                    squared += error * error;
                    scored += 1;
                    max_error = max_error.max(error);
                }
            }
        }

        // Every departure must have been noticed by someone
        if owners.len() > 1 {
            for gone in &self.departed {
                let removed: u64 = self.online().map(|p| p.session.registry().scene().despawns_of(gone)).sum();
                if removed == 0 {
                    failures.push(format!("departure of {} went unnoticed", gone.short()));
                }
            }
        }

        let rms_error = (scored > 0).then(|| (squared / scored as f64).sqrt());
        if let Some(rms) = rms_error {
            let threshold = max_speed * plan.lag_budget_secs + 0.1;
            if rms > threshold {
                failures.push(format!("RMS error {:.2}m exceeds threshold {:.2}m", rms, threshold));
            }
        }

        Evaluation {
            failures,
            rms_error,
            max_error,
        }
    }

    fn metrics(&self, evaluation: &Evaluation) -> ScenarioMetrics {
        let mut metrics = ScenarioMetrics {
            relay: self.relay.metrics().clone(),
            rms_error_m: evaluation.rms_error,
            max_error_m: evaluation.max_error,
            ..Default::default()
        };

        for peer in &self.peers {
            let summary = peer.session.summary();
            let scene = peer.session.registry().scene();
            metrics.updates_sent += summary.updates_sent;
            metrics.updates_failed += summary.updates_failed;
            metrics.decode_errors += summary.decode_errors;
            metrics.proxies_spawned += scene.spawned();
            metrics.proxies_despawned += scene.despawned();
        }

        let latencies: Vec<_> = self
            .online()
            .filter_map(|p| p.session.registry().latency().summary())
            .collect();
        if !latencies.is_empty() {
            metrics.mean_latency_ms = latencies.iter().map(|l| l.mean_ms).sum::<f64>() / latencies.len() as f64;
            metrics.max_latency_ms = latencies.iter().map(|l| l.max_ms).max().unwrap_or(0);
        }
        metrics
    }
}

/// Runs scenarios on a virtual clock.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers (scenarios may add more)
    num_peers: usize,

    /// Simulation step in milliseconds
    tick_ms: u64,

    /// Requested duration in seconds
    duration_secs: f64,

    /// Per-peer session settings
    sync: SyncConfig,

    /// Export sampling interval
    export_every_ms: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers,
            tick_ms: 1,
            duration_secs: 10.0,
            sync: SyncConfig::default(),
            export_every_ms: 100,
        }
    }

    /// Sets the simulation step.
    pub fn with_tick(mut self, ms: u64) -> Self {
        self.tick_ms = ms.max(1);
        self
    }

    /// Sets the duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Sets the session settings every peer starts with.
    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_export(scenario, None)
    }

    /// Runs a scenario, sampling frames into `export` if given.
    pub fn run_with_export(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> ScenarioResult {
        let plan = scenario.plan(self.num_peers, self.duration_secs);
        if let Err(e) = self.sync.validate() {
            warn!("✗ {} not started: {}", scenario.name(), e);
            return ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_secs: 0.0,
                final_peer_count: 0,
                failure_reason: Some(e.to_string()),
                metrics: ScenarioMetrics::default(),
            };
        }
        info!(
            "Starting scenario: {} (seed={}, peers={})",
            scenario.name(),
            self.seed,
            plan.total_peers()
        );

        let mut world = World::new(self.seed, &plan, self.sync.clone());
        let mut events = Vec::new();
        for _ in 0..plan.initial_peers {
            events.push(world.join());
        }

        let tick = Duration::from_millis(self.tick_ms);
        let total_ticks = (plan.duration_secs * 1000.0 / self.tick_ms as f64).round() as u64;
        let export_every = (self.export_every_ms / self.tick_ms).max(1);
        let mut script = plan.script.iter().peekable();

        for tick_no in 1..=total_ticks {
            world.context.advance_time(tick);
            let now = world.context.now();
            let now_secs = now.as_secs_f64();

            while let Some(step) = script.next_if(|s| s.at_secs <= now_secs) {
                events.push(world.apply(&step.action));
            }
            world.step(now);

            match export.as_deref_mut() {
                Some(export) if tick_no % export_every == 0 => {
                    export.add_frame(world.frame(std::mem::take(&mut events)));
                }
                Some(_) => {}
                None => events.clear(),
            }

            if tick_no % 1000 == 0 {
                debug!(
                    "  t={:.1}s | peers={} | batches={}",
                    now_secs,
                    world.relay.online_peers().len(),
                    world.relay.metrics().batches_sent
                );
            }
        }

        let evaluation = world.evaluate(&plan);
        let metrics = world.metrics(&evaluation);
        let passed = evaluation.failures.is_empty();
        let failure_reason = (!passed).then(|| evaluation.failures.join("; "));

        if passed {
            info!(
                "✓ {} complete: {} updates, {} batches, RMS error {:.2}m",
                scenario.name(),
                metrics.updates_sent,
                metrics.relay.batches_sent,
                metrics.rms_error_m.unwrap_or(0.0)
            );
        } else {
            warn!(
                "✗ {} failed: {}",
                scenario.name(),
                failure_reason.as_deref().unwrap_or("unknown")
            );
        }

        if let Some(export) = export {
            export.finalize(passed, metrics.rms_error_m);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks,
            final_time_secs: world.context.now().as_secs_f64(),
            final_peer_count: world.relay.online_peers().len(),
            failure_reason,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_core::FirstSightingPolicy;

    fn runner(seed: u64) -> ScenarioRunner {
        ScenarioRunner::new(seed, 4).with_duration(8.0)
    }

    fn assert_passes(result: &ScenarioResult) {
        assert!(
            result.passed,
            "{} failed: {:?}",
            result.scenario,
            result.failure_reason
        );
    }

    #[test]
    fn test_steady_state_converges() {
        let result = runner(42).run(ScenarioId::SteadyState);
        assert_passes(&result);
        assert_eq!(result.final_peer_count, 4);
        assert_eq!(result.total_ticks, 8000);
        // 4 peers publishing every 50 ms for 8 s
        assert!(result.metrics.updates_sent >= 4 * 155);
        assert!(result.metrics.relay.batches_sent >= 79);
        assert!(result.metrics.rms_error_m.is_some());
    }

    #[test]
    fn test_join_leave_releases_proxy() {
        let result = runner(7).run(ScenarioId::JoinLeave);
        assert_passes(&result);
        assert_eq!(result.final_peer_count, 3);
        assert!(result.metrics.proxies_despawned >= 2);
    }

    #[test]
    fn test_link_flap_reenters_under_new_id() {
        let result = runner(3).run(ScenarioId::LinkFlap);
        assert_passes(&result);
        assert_eq!(result.final_peer_count, 4);
        assert_eq!(result.metrics.relay.connects, 5);
    }

    #[test]
    fn test_every_scenario_passes() {
        for scenario in ScenarioId::all() {
            let result = runner(42).run(scenario);
            assert_passes(&result);
        }
    }

    #[test]
    fn test_immediate_first_sighting_also_passes() {
        let sync = SyncConfig {
            first_sighting: FirstSightingPolicy::Immediate,
            ..SyncConfig::default()
        };
        let result = runner(11).with_sync_config(sync).run(ScenarioId::LateJoiner);
        assert_passes(&result);
    }

    #[test]
    fn test_invalid_sync_config_fails_without_running() {
        let sync = SyncConfig {
            publish_period_ms: 0,
            ..SyncConfig::default()
        };
        let result = runner(3).with_sync_config(sync).run(ScenarioId::SteadyState);
        assert!(!result.passed);
        assert_eq!(result.total_ticks, 0);
        assert!(result.failure_reason.unwrap().contains("publish_period_ms"));
    }

    #[test]
    fn test_determinism() {
        let a = runner(99).run(ScenarioId::Jitter);
        let b = runner(99).run(ScenarioId::Jitter);
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.metrics, b.metrics);
    }

    #[test]
    fn test_export_samples_frames() {
        let mut export = SimExport::new("steady_state", 5);
        let result = runner(5).run_with_export(ScenarioId::SteadyState, Some(&mut export));

        assert_eq!(export.frames.len(), 80);
        assert_eq!(export.passed, result.passed);
        let last = export.frames.last().unwrap();
        assert_eq!(last.ground_truth.len(), 4);
        assert!(last.observers.iter().all(|o| o.proxies.len() == 3));
        // Join events land in the first frame
        assert_eq!(export.frames[0].events.len(), 4);
    }
}
