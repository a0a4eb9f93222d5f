//! In-memory scene and transport used by the unit tests.

use crate::pose::Pose;
use crate::scene::ProxyScene;
use async_trait::async_trait;
use peersync_env::{EnvError, EventEnvelope, PeerId, Transport};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct MockScene {
    next_handle: u64,
    pub live: BTreeMap<u64, PeerId>,
    pub spawned: Vec<PeerId>,
    pub despawned: Vec<PeerId>,
    pub placed: Vec<(u64, Pose)>,
}

impl MockScene {
    pub fn handle_of(&self, peer: &PeerId) -> Option<u64> {
        self.live.iter().find(|(_, id)| *id == peer).map(|(h, _)| *h)
    }
}

impl ProxyScene for MockScene {
    type Handle = u64;

    fn spawn_proxy(&mut self, peer: &PeerId, _initial: &Pose) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.live.insert(handle, peer.clone());
        self.spawned.push(peer.clone());
        handle
    }

    fn despawn_proxy(&mut self, peer: &PeerId, handle: u64) {
        assert!(self.live.remove(&handle).is_some(), "double despawn of {}", peer);
        self.despawned.push(peer.clone());
    }

    fn place_proxy(&mut self, handle: &u64, pose: &Pose) {
        self.placed.push((*handle, *pose));
    }
}

pub struct MockTransport {
    connected: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<EventEnvelope>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<EventEnvelope>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventEnvelope>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            inbox_tx: Mutex::new(Some(tx)),
            inbox_rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Queues an inbound event.
    pub fn push(&self, envelope: EventEnvelope) {
        if let Some(tx) = self.inbox_tx.lock().unwrap().as_ref() {
            let _ = tx.send(envelope);
        }
    }

    /// Closes the inbound side; `recv` returns `None` once drained.
    pub fn close(&self) {
        self.inbox_tx.lock().unwrap().take();
    }

    pub fn sent(&self) -> Vec<EventEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn emit(&self, event: EventEnvelope) -> Result<(), EnvError> {
        if !self.is_connected() {
            return Err(EnvError::Disconnected);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnvError::send_failed("mock failure"));
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    async fn recv(&self) -> Option<EventEnvelope> {
        self.inbox_rx.lock().await.recv().await
    }

    fn try_recv(&self) -> Option<EventEnvelope> {
        self.inbox_rx.try_lock().ok()?.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
