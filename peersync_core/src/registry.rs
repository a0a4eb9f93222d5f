//! The Peer State Registry - remote peer proxies and their smoothing.
//!
//! Owns one `PeerRecord` per remote peer id together with the scene handle
//! of its proxy. Per id the lifecycle is:
//!
//! ```text
//! Unknown --1st sighting--> Registered(no target) --2nd sighting--> Registered(target)
//!    ^                                |                                   |
//!    +-------------------- removeClient (record and handle dropped) ------+
//! ```
//!
//! Removal forgets the id entirely, so an id that shows up again starts over
//! from `Unknown`.

use crate::config::{FirstSightingPolicy, SyncConfig};
use crate::latency::LatencyBoard;
use crate::pose::Pose;
use crate::protocol::{SnapshotBatch, SnapshotMessage};
use crate::scene::ProxyScene;
use nalgebra::{UnitQuaternion, Vector3};
use peersync_env::PeerId;
use std::collections::HashMap;
use tracing::{debug, info, trace};

// ============================================================================
// PEER RECORD
// ============================================================================

/// Local state for one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord<H> {
    id: PeerId,

    /// Scene handle of the proxy, owned exclusively by the registry
    handle: H,

    /// Pose the proxy is currently drawn at
    current: Pose,

    /// Latest received position, if any
    target_position: Option<Vector3<f64>>,

    /// Latest received orientation, if any
    target_orientation: Option<UnitQuaternion<f64>>,

    /// Batches this id appeared in since it was (re)created
    sightings: u64,

    /// Most recent `t` seen for this peer
    last_timestamp_ms: Option<u64>,
}

impl<H> PeerRecord<H> {
    fn new(id: PeerId, handle: H, initial: Pose, timestamp_ms: Option<u64>) -> Self {
        Self {
            id,
            handle,
            current: initial,
            target_position: None,
            target_orientation: None,
            sightings: 1,
            last_timestamp_ms: timestamp_ms,
        }
    }

    /// Replaces the target parts present in the snapshot.
    ///
    /// Returns true if anything changed.
    fn retarget(&mut self, snapshot: &SnapshotMessage) -> bool {
        let mut changed = false;
        if let Some(position) = snapshot.target_position() {
            self.target_position = Some(position);
            changed = true;
        }
        if let Some(orientation) = snapshot.target_orientation() {
            self.target_orientation = Some(orientation);
            changed = true;
        }
        changed
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn current_pose(&self) -> &Pose {
        &self.current
    }

    pub fn target_position(&self) -> Option<&Vector3<f64>> {
        self.target_position.as_ref()
    }

    pub fn target_orientation(&self) -> Option<&UnitQuaternion<f64>> {
        self.target_orientation.as_ref()
    }

    pub fn has_target(&self) -> bool {
        self.target_position.is_some() || self.target_orientation.is_some()
    }

    pub fn sightings(&self) -> u64 {
        self.sightings
    }

    pub fn last_timestamp_ms(&self) -> Option<u64> {
        self.last_timestamp_ms
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// What a snapshot batch did to the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Ids that got a new proxy
    pub created: Vec<PeerId>,

    /// Ids whose target changed
    pub retargeted: Vec<PeerId>,

    /// Known ids whose entry carried no usable pose field
    pub unchanged: usize,
}

/// Set of remote peer proxies keyed by peer id.
pub struct PeerRegistry<S: ProxyScene> {
    scene: S,
    peers: HashMap<PeerId, PeerRecord<S::Handle>>,
    latency: LatencyBoard,
    local_id: Option<PeerId>,
    first_sighting: FirstSightingPolicy,
    mirror_local_peer: bool,
}

impl<S: ProxyScene> PeerRegistry<S> {
    pub fn new(scene: S, config: &SyncConfig) -> Self {
        Self {
            scene,
            peers: HashMap::new(),
            latency: LatencyBoard::new(config.latency_smoothing),
            local_id: None,
            first_sighting: config.first_sighting,
            mirror_local_peer: config.mirror_local_peer,
        }
    }

    /// Tells the registry which id is our own.
    ///
    /// Unless local mirroring is on, a proxy already created for that id is
    /// removed.
    pub fn set_local_id(&mut self, id: Option<PeerId>) {
        self.local_id = id;
        if self.mirror_local_peer {
            return;
        }
        if let Some(local) = self.local_id.clone() {
            if self.peers.contains_key(&local) {
                debug!("Dropping proxy created for local id {}", local);
                self.on_peer_removed(&local);
            }
        }
    }

    fn is_local(&self, peer: &PeerId) -> bool {
        !self.mirror_local_peer && self.local_id.as_ref() == Some(peer)
    }

    /// Reconciles a `clients` batch against the registry.
    ///
    /// Unknown ids get a proxy at the default pose. With the deferred policy
    /// that first entry is consumed by the creation and its pose is ignored.
    /// Known ids have the pose fields present in their entry copied into the
    /// target; absent fields keep the previous target.
    pub fn on_snapshot_batch(&mut self, batch: &SnapshotBatch, now_ms: u64) -> BatchOutcome {
        self.latency.record_batch(batch, now_ms);

        let mut outcome = BatchOutcome::default();
        for (peer, snapshot) in batch {
            if self.is_local(peer) {
                continue;
            }

            match self.peers.get_mut(peer) {
                Some(record) => {
                    record.sightings += 1;
                    if snapshot.timestamp_ms.is_some() {
                        record.last_timestamp_ms = snapshot.timestamp_ms;
                    }
                    if record.retarget(snapshot) {
                        outcome.retargeted.push(peer.clone());
                    } else {
                        outcome.unchanged += 1;
                    }
                }
                None => {
                    let initial = Pose::identity();
                    let handle = self.scene.spawn_proxy(peer, &initial);
                    let mut record = PeerRecord::new(peer.clone(), handle, initial, snapshot.timestamp_ms);

                    if self.first_sighting == FirstSightingPolicy::Immediate && record.retarget(snapshot) {
                        outcome.retargeted.push(peer.clone());
                    }

                    info!("Peer {} joined ({} live)", peer, self.peers.len() + 1);
                    self.peers.insert(peer.clone(), record);
                    outcome.created.push(peer.clone());
                }
            }
        }

        debug!(
            created = outcome.created.len(),
            retargeted = outcome.retargeted.len(),
            unchanged = outcome.unchanged,
            "Snapshot batch reconciled"
        );
        outcome
    }

    /// Destroys the record and proxy of a departed peer.
    ///
    /// Returns false (and does nothing else) for ids that are not registered.
    pub fn on_peer_removed(&mut self, peer: &PeerId) -> bool {
        self.latency.forget(peer);
        match self.peers.remove(peer) {
            Some(record) => {
                self.scene.despawn_proxy(peer, record.handle);
                info!("Peer {} left ({} live)", peer, self.peers.len());
                true
            }
            None => {
                debug!("Ignoring removal of unknown peer {}", peer);
                false
            }
        }
    }

    /// Moves every targeted proxy `frame_fraction` of the way to its target.
    ///
    /// Returns how many proxies were moved.
    pub fn advance(&mut self, frame_fraction: f64) -> usize {
        let mut moved = 0;
        for record in self.peers.values_mut() {
            if !record.has_target() {
                continue;
            }
            record.current = record.current.converge_toward(
                record.target_position.as_ref(),
                record.target_orientation.as_ref(),
                frame_fraction,
            );
            self.scene.place_proxy(&record.handle, &record.current);
            moved += 1;
        }
        trace!(moved, "Advanced proxies");
        moved
    }

    /// Destroys every proxy. Returns how many were released.
    pub fn clear(&mut self) -> usize {
        let count = self.peers.len();
        for (peer, record) in self.peers.drain() {
            self.scene.despawn_proxy(&peer, record.handle);
        }
        self.latency.clear();
        count
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord<S::Handle>> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered peer ids, sorted.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every live proxy with its already-advanced pose, for drawing.
    pub fn proxies(&self) -> impl Iterator<Item = (&PeerId, &Pose, &S::Handle)> + '_ {
        self.peers.iter().map(|(id, record)| (id, &record.current, &record.handle))
    }

    pub fn latency(&self) -> &LatencyBoard {
        &self.latency
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockScene;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn registry() -> PeerRegistry<MockScene> {
        PeerRegistry::new(MockScene::default(), &SyncConfig::default())
    }

    fn id(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn snap(t: u64, p: Option<[f64; 3]>, q: Option<[f64; 4]>) -> SnapshotMessage {
        SnapshotMessage {
            timestamp_ms: Some(t),
            position: p,
            orientation: q,
        }
    }

    fn batch(entries: Vec<(&str, SnapshotMessage)>) -> SnapshotBatch {
        entries.into_iter().map(|(k, v)| (id(k), v)).collect()
    }

    const IDENTITY_Q: [f64; 4] = [0.0, 0.0, 0.0, 1.0];

    /// Registers `peer` and gives it a target position via two sightings.
    fn with_target(reg: &mut PeerRegistry<MockScene>, peer: &str, p: [f64; 3]) {
        reg.on_snapshot_batch(&batch(vec![(peer, snap(0, Some([0.0; 3]), Some(IDENTITY_Q)))]), 0);
        reg.on_snapshot_batch(&batch(vec![(peer, snap(1, Some(p), Some(IDENTITY_Q)))]), 1);
    }

    #[test]
    fn test_no_proxy_for_unseen_ids() {
        let mut reg = registry();
        reg.on_snapshot_batch(&batch(vec![("a", snap(1, None, None))]), 10);

        assert!(reg.contains(&id("a")));
        assert!(!reg.contains(&id("b")));
        assert!(!reg.on_peer_removed(&id("b")));
        assert_eq!(reg.scene().spawned, vec![id("a")]);
    }

    #[test]
    fn test_first_sighting_creates_without_target() {
        let mut reg = registry();
        let outcome = reg.on_snapshot_batch(&batch(vec![("p1", snap(100, Some([5.0, 0.0, 0.0]), Some(IDENTITY_Q)))]), 100);

        assert_eq!(outcome.created, vec![id("p1")]);
        assert!(outcome.retargeted.is_empty());
        let record = reg.get(&id("p1")).unwrap();
        assert!(!record.has_target());
        assert_eq!(record.current_pose(), &Pose::identity());

        let outcome = reg.on_snapshot_batch(&batch(vec![("p1", snap(150, Some([5.0, 0.0, 0.0]), None))]), 150);
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.retargeted, vec![id("p1")]);
        assert_eq!(reg.get(&id("p1")).unwrap().target_position(), Some(&Vector3::new(5.0, 0.0, 0.0)));
        assert_eq!(reg.get(&id("p1")).unwrap().sightings(), 2);

        // Only ever one proxy for the id
        assert_eq!(reg.scene().spawned.len(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_untargeted_proxy_does_not_move() {
        let mut reg = registry();
        reg.on_snapshot_batch(&batch(vec![("p1", snap(0, Some([3.0, 3.0, 3.0]), None))]), 0);
        assert_eq!(reg.advance(0.1), 0);
        assert_eq!(reg.get(&id("p1")).unwrap().current_pose(), &Pose::identity());
        assert!(reg.scene().placed.is_empty());
    }

    #[test]
    fn test_immediate_policy_applies_first_pose() {
        let config = SyncConfig {
            first_sighting: FirstSightingPolicy::Immediate,
            ..SyncConfig::default()
        };
        let mut reg = PeerRegistry::new(MockScene::default(), &config);
        let outcome = reg.on_snapshot_batch(&batch(vec![("p1", snap(0, Some([2.0, 0.0, 0.0]), None))]), 0);

        assert_eq!(outcome.created, vec![id("p1")]);
        assert_eq!(outcome.retargeted, vec![id("p1")]);
        reg.advance(0.1);
        assert_relative_eq!(reg.get(&id("p1")).unwrap().current_pose().position.x, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_absent_fields_retain_previous_target() {
        let mut reg = registry();
        with_target(&mut reg, "abc", [1.0, 0.0, 0.0]);
        let before_q = *reg.get(&id("abc")).unwrap().target_orientation().unwrap();

        let outcome = reg.on_snapshot_batch(&batch(vec![("abc", snap(1000, None, None))]), 1000);

        assert_eq!(outcome.unchanged, 1);
        let record = reg.get(&id("abc")).unwrap();
        assert_eq!(record.target_position(), Some(&Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(record.target_orientation(), Some(&before_q));
        assert_eq!(record.last_timestamp_ms(), Some(1000));
    }

    #[test]
    fn test_orientation_only_update_keeps_position_target() {
        let mut reg = registry();
        with_target(&mut reg, "abc", [1.0, 0.0, 0.0]);
        let turned = [0.0, 0.0, std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
        reg.on_snapshot_batch(&batch(vec![("abc", snap(2, None, Some(turned)))]), 2);

        let record = reg.get(&id("abc")).unwrap();
        assert_eq!(record.target_position(), Some(&Vector3::new(1.0, 0.0, 0.0)));
        assert_relative_eq!(record.target_orientation().unwrap().angle(), std::f64::consts::FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn test_end_to_end_first_advance() {
        let mut reg = registry();
        reg.on_snapshot_batch(&batch(vec![("p1", snap(100, Some([0.0, 0.0, 0.0]), Some(IDENTITY_Q)))]), 100);
        assert!(!reg.get(&id("p1")).unwrap().has_target());

        reg.on_snapshot_batch(&batch(vec![("p1", snap(150, Some([2.0, 0.0, 0.0]), Some(IDENTITY_Q)))]), 150);
        assert_eq!(reg.get(&id("p1")).unwrap().target_position(), Some(&Vector3::new(2.0, 0.0, 0.0)));

        reg.advance(0.1);
        let pos = reg.get(&id("p1")).unwrap().current_pose().position;
        assert_relative_eq!(pos.x, 0.2, epsilon = 1e-12);
        assert_relative_eq!(pos.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(pos.z, 0.0, epsilon = 1e-12);

        // Removal: proxy destroyed, later frames never touch it
        let handle = reg.scene().handle_of(&id("p1")).unwrap();
        assert!(reg.on_peer_removed(&id("p1")));
        assert_eq!(reg.scene().despawned, vec![id("p1")]);

        let placed_before = reg.scene().placed.len();
        assert_eq!(reg.advance(0.1), 0);
        assert_eq!(reg.scene().placed.len(), placed_before);
        assert!(reg.scene().placed.iter().all(|(h, _)| *h == handle));
        assert!(reg.proxies().next().is_none());
    }

    #[test]
    fn test_removal_is_idempotent() {
        let mut reg = registry();
        with_target(&mut reg, "p1", [1.0, 0.0, 0.0]);

        assert!(reg.on_peer_removed(&id("p1")));
        assert!(!reg.on_peer_removed(&id("p1")));
        assert!(!reg.on_peer_removed(&id("never-seen")));
        assert_eq!(reg.scene().despawned.len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reappearing_id_starts_over() {
        let mut reg = registry();
        with_target(&mut reg, "p1", [1.0, 0.0, 0.0]);
        reg.on_peer_removed(&id("p1"));

        reg.on_snapshot_batch(&batch(vec![("p1", snap(5, Some([9.0, 0.0, 0.0]), None))]), 5);
        let record = reg.get(&id("p1")).unwrap();
        assert!(!record.has_target());
        assert_eq!(record.sightings(), 1);
        assert_eq!(reg.scene().spawned.len(), 2);
    }

    #[test]
    fn test_new_target_redirects_immediately() {
        let mut reg = registry();
        with_target(&mut reg, "p1", [10.0, 0.0, 0.0]);
        for _ in 0..5 {
            reg.advance(0.1);
        }
        let mid = reg.get(&id("p1")).unwrap().current_pose().position;

        reg.on_snapshot_batch(&batch(vec![("p1", snap(9, Some([0.0, 10.0, 0.0]), None))]), 9);
        reg.advance(0.1);

        let new_target = Vector3::new(0.0, 10.0, 0.0);
        let expected = mid + (new_target - mid) * 0.1;
        let pos = reg.get(&id("p1")).unwrap().current_pose().position;
        assert_relative_eq!(pos, expected, epsilon = 1e-9);
        // Moving away from the old target's axis
        assert!(pos.x < mid.x);
    }

    #[test]
    fn test_local_id_is_not_mirrored() {
        let mut reg = registry();
        reg.on_snapshot_batch(&batch(vec![("me", snap(0, None, None)), ("other", snap(0, None, None))]), 0);
        assert_eq!(reg.len(), 2);

        reg.set_local_id(Some(id("me")));
        assert!(!reg.contains(&id("me")));

        reg.on_snapshot_batch(&batch(vec![("me", snap(1, None, None))]), 1);
        assert!(!reg.contains(&id("me")));
        assert_eq!(reg.ids(), vec![id("other")]);
        // Latency is still reported for the local entry
        assert_eq!(reg.latency().lines(), vec!["me 0ms".to_string()]);
    }

    #[test]
    fn test_mirroring_keeps_local_proxy() {
        let config = SyncConfig {
            mirror_local_peer: true,
            ..SyncConfig::default()
        };
        let mut reg = PeerRegistry::new(MockScene::default(), &config);
        reg.set_local_id(Some(id("me")));
        reg.on_snapshot_batch(&batch(vec![("me", snap(0, None, None))]), 0);
        assert!(reg.contains(&id("me")));
    }

    #[test]
    fn test_latency_recorded_per_batch() {
        let mut reg = registry();
        reg.on_snapshot_batch(&batch(vec![("a", snap(940, None, None))]), 1000);
        assert_eq!(reg.latency().lines(), vec!["a 60ms".to_string()]);

        reg.on_peer_removed(&id("a"));
        assert!(reg.latency().lines().is_empty());
    }

    #[test]
    fn test_oversized_timestamp_from_wire_is_tolerated() {
        use crate::protocol::{InboundEvent, EVENT_CLIENTS};
        use peersync_env::EventEnvelope;

        let payload = serde_json::json!({ "p1": { "t": 9223372036854775808u64 } });
        let batch = match InboundEvent::decode(&EventEnvelope::new(EVENT_CLIENTS, payload)).unwrap() {
            InboundEvent::Clients(batch) => batch,
            other => panic!("expected clients, got {:?}", other),
        };

        let mut reg = registry();
        let outcome = reg.on_snapshot_batch(&batch, 1_700_000_000_000);
        assert_eq!(outcome.created, vec![id("p1")]);
        assert!(reg.contains(&id("p1")));
        assert_eq!(reg.latency().lines(), vec!["p1 -".to_string()]);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut reg = registry();
        reg.on_snapshot_batch(&batch(vec![("a", snap(0, None, None)), ("b", snap(0, None, None))]), 0);
        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
        assert!(reg.scene().live.is_empty());
    }

    proptest! {
        #[test]
        fn prop_convergence_is_monotone_without_overshoot(
            tx in -1000.0f64..1000.0,
            ty in -1000.0f64..1000.0,
            tz in -1000.0f64..1000.0,
            fraction in 0.01f64..0.99,
        ) {
            let mut reg = registry();
            with_target(&mut reg, "p", [tx, ty, tz]);
            let target = Vector3::new(tx, ty, tz);

            let mut prev = reg.get(&id("p")).unwrap().current_pose().position;
            for _ in 0..10_000 {
                let before = (target - prev).norm();
                if before < 1e-9 {
                    break;
                }
                reg.advance(fraction);
                let next = reg.get(&id("p")).unwrap().current_pose().position;
                let after = (target - next).norm();

                prop_assert!(after < before);
                for axis in 0..3 {
                    // Never crosses the target on any axis
                    prop_assert!((target[axis] - next[axis]) * (target[axis] - prev[axis]) >= 0.0);
                }
                prev = next;
            }
            prop_assert!((target - prev).norm() < 1e-9);
        }
    }
}
