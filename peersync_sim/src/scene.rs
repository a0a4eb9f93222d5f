//! A headless scene that records what the registry does to it.

use peersync_core::{Pose, ProxyScene};
use peersync_env::PeerId;
use std::collections::BTreeMap;

/// Opaque handle to a recorded proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyHandle(u64);

/// One live proxy as the scene sees it.
#[derive(Debug, Clone)]
pub struct ProxyNode {
    pub peer: PeerId,
    pub pose: Pose,
}

/// Scene graph stand-in for simulated peers.
#[derive(Debug, Default)]
pub struct RecordingScene {
    next_handle: u64,
    live: BTreeMap<ProxyHandle, ProxyNode>,
    spawned: u64,
    despawned: u64,
    /// Despawns naming a handle the scene no longer holds
    stray_despawns: u64,
    /// Spawns per peer, across its whole history
    spawns_by_peer: BTreeMap<PeerId, u64>,
    /// Despawns per peer, across its whole history
    despawns_by_peer: BTreeMap<PeerId, u64>,
}

impl RecordingScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    pub fn despawned(&self) -> u64 {
        self.despawned
    }

    pub fn stray_despawns(&self) -> u64 {
        self.stray_despawns
    }

    pub fn spawns_of(&self, peer: &PeerId) -> u64 {
        self.spawns_by_peer.get(peer).copied().unwrap_or(0)
    }

    pub fn despawns_of(&self, peer: &PeerId) -> u64 {
        self.despawns_by_peer.get(peer).copied().unwrap_or(0)
    }

    /// Live proxies, in spawn order.
    pub fn nodes(&self) -> impl Iterator<Item = &ProxyNode> {
        self.live.values()
    }

    /// Pose last placed for `peer`'s live proxy.
    pub fn pose_of(&self, peer: &PeerId) -> Option<&Pose> {
        self.live.values().find(|n| &n.peer == peer).map(|n| &n.pose)
    }

    /// True when every live proxy belongs to a distinct peer.
    pub fn is_consistent(&self) -> bool {
        let mut peers: Vec<&PeerId> = self.live.values().map(|n| &n.peer).collect();
        peers.sort();
        peers.dedup();
        peers.len() == self.live.len()
            && self.stray_despawns == 0
            && self.spawned - self.despawned == self.live.len() as u64
    }
}

impl ProxyScene for RecordingScene {
    type Handle = ProxyHandle;

    fn spawn_proxy(&mut self, peer: &PeerId, initial: &Pose) -> ProxyHandle {
        let handle = ProxyHandle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(
            handle,
            ProxyNode {
                peer: peer.clone(),
                pose: *initial,
            },
        );
        self.spawned += 1;
        *self.spawns_by_peer.entry(peer.clone()).or_default() += 1;
        handle
    }

    fn despawn_proxy(&mut self, peer: &PeerId, handle: ProxyHandle) {
        if self.live.remove(&handle).is_none() {
            self.stray_despawns += 1;
            return;
        }
        self.despawned += 1;
        *self.despawns_by_peer.entry(peer.clone()).or_default() += 1;
    }

    fn place_proxy(&mut self, handle: &ProxyHandle, pose: &Pose) {
        if let Some(node) = self.live.get_mut(handle) {
            node.pose = *pose;
        }
    }
}
