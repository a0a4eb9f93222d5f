//! The Local Pose Publisher - fire-and-forget `update` emission.

use crate::error::SyncError;
use crate::pose::Pose;
use crate::protocol::UpdateMessage;
use peersync_env::{PeerId, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Read access to the local object's live transform.
///
/// The publisher samples it every tick and never writes to it.
pub trait PoseSource {
    fn current_pose(&self) -> Pose;
}

impl PoseSource for Pose {
    fn current_pose(&self) -> Pose {
        *self
    }
}

impl<P: PoseSource + ?Sized> PoseSource for Arc<P> {
    fn current_pose(&self) -> Pose {
        (**self).current_pose()
    }
}

/// Emits the local pose once per tick after the transport assigned an id.
pub struct PosePublisher<Net: Transport> {
    transport: Arc<Net>,
    period: Duration,
    local_id: Option<PeerId>,
    sent: u64,
    failed: u64,
}

impl<Net: Transport> PosePublisher<Net> {
    pub fn new(transport: Arc<Net>, period: Duration) -> Self {
        Self {
            transport,
            period,
            local_id: None,
            sent: 0,
            failed: 0,
        }
    }

    /// Starts publishing under the assigned id.
    ///
    /// The relay assigns one id per connection; a later assignment (after a
    /// reconnect) replaces the previous one. Returns true if the id changed.
    pub fn activate(&mut self, id: PeerId) -> bool {
        if self.local_id.as_ref() == Some(&id) {
            debug!("Publisher already active as {}", id);
            return false;
        }
        match self.local_id.replace(id.clone()) {
            Some(previous) => info!("Publisher re-activated as {} (was {})", id, previous),
            None => info!("Publisher activated as {}", id),
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.local_id.is_some()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Samples `source` and emits one `update` stamped `now_ms`.
    ///
    /// Does nothing before activation or while the transport is down. Send
    /// errors are logged and counted, never retried. Returns true if the
    /// update was handed to the transport.
    pub fn publish_tick<P: PoseSource + ?Sized>(&mut self, source: &P, now_ms: u64) -> bool {
        if !self.is_active() {
            trace!("Publish tick before id assignment, skipping");
            return false;
        }
        if !self.transport.is_connected() {
            trace!("Publish tick while disconnected, skipping");
            return false;
        }

        match self.emit_update(&UpdateMessage::from_pose(&source.current_pose(), now_ms)) {
            Ok(()) => {
                self.sent += 1;
                true
            }
            Err(e) => {
                self.failed += 1;
                warn!(error = %e, "Pose update not sent");
                false
            }
        }
    }

    fn emit_update(&self, update: &UpdateMessage) -> Result<(), SyncError> {
        let envelope = update.to_envelope()?;
        self.transport.emit(envelope)?;
        Ok(())
    }

    /// Updates handed to the transport so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Updates lost to send errors so far.
    pub fn failed(&self) -> u64 {
        self.failed
    }
}
