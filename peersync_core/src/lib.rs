//! PeerSync Core - Peer Pose Synchronization
//!
//! Keeps the on-screen proxies of remote peers approximately in step with
//! their owners over a lightweight event transport:
//! 1. **Publishing**: the local pose goes out as `update` every 50 ms
//! 2. **Reconciliation**: `clients` snapshot batches create and retarget proxies
//! 3. **Smoothing**: every render frame moves proxies a fixed fraction toward
//!    their latest target (lerp + slerp)

pub mod pose;
pub mod protocol;
pub mod error;
pub mod config;
pub mod scene;
pub mod latency;
pub mod registry;
pub mod publisher;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience
pub use pose::Pose;
pub use protocol::{InboundEvent, SnapshotBatch, SnapshotMessage, UpdateMessage, EVENT_UPDATE};
pub use error::{ProtocolError, SyncError};
pub use config::{FirstSightingPolicy, SyncConfig};
pub use scene::ProxyScene;
pub use latency::{LatencyBoard, LatencyStats, LatencySummary};
pub use registry::{BatchOutcome, PeerRecord, PeerRegistry};
pub use publisher::{PosePublisher, PoseSource};
pub use session::{Cadence, SessionSummary, SyncSession};
