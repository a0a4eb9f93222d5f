//! Wire protocol: the named events exchanged with the relay.
//!
//! ```text
//! relay -> peer   "id"            "<peer id>"
//! relay -> peer   "clients"       { "<peer id>": { t?, p?: [x,y,z], q?: [x,y,z,w] }, ... }
//! relay -> peer   "removeClient"  "<peer id>"
//! relay -> peer   "connect" / "disconnect"
//! peer  -> relay  "update"        { t, p: [x,y,z], q: [x,y,z,w] }
//! ```
//!
//! Snapshot fields are optional on the wire. A field that is absent, or
//! present but unusable, decodes to `None` ("retain previous target").

use crate::error::ProtocolError;
use crate::pose::{orientation_from_wire, position_from_wire, Pose};
use nalgebra::{UnitQuaternion, Vector3};
use peersync_env::{EventEnvelope, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const EVENT_ID: &str = "id";
pub const EVENT_CLIENTS: &str = "clients";
pub const EVENT_REMOVE_CLIENT: &str = "removeClient";
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_UPDATE: &str = "update";

// ============================================================================
// SNAPSHOTS (relay -> peer)
// ============================================================================

/// One peer's entry in a `clients` broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    /// Wall-clock ms of the peer's last publish
    #[serde(
        rename = "t",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp_ms: Option<u64>,

    /// Last reported position `[x, y, z]`
    #[serde(
        rename = "p",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub position: Option<[f64; 3]>,

    /// Last reported orientation `[x, y, z, w]`
    #[serde(
        rename = "q",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub orientation: Option<[f64; 4]>,
}

impl SnapshotMessage {
    /// A snapshot carrying only a timestamp.
    pub fn stamped(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms: Some(timestamp_ms),
            ..Self::default()
        }
    }

    /// A snapshot carrying a full pose.
    pub fn with_pose(timestamp_ms: u64, pose: &Pose) -> Self {
        Self {
            timestamp_ms: Some(timestamp_ms),
            position: Some(pose.position_to_wire()),
            orientation: Some(pose.orientation_to_wire()),
        }
    }

    /// The position as a target, if present and usable.
    pub fn target_position(&self) -> Option<Vector3<f64>> {
        self.position.and_then(position_from_wire)
    }

    /// The orientation as a target, if present and usable.
    pub fn target_orientation(&self) -> Option<UnitQuaternion<f64>> {
        self.orientation.and_then(orientation_from_wire)
    }
}

/// A full `clients` broadcast, ordered by peer id.
pub type SnapshotBatch = BTreeMap<PeerId, SnapshotMessage>;

/// Decodes a field, mapping anything unusable to `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Accepts integer or float millisecond timestamps up to `i64::MAX`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    const MAX_TIMESTAMP_MS: u64 = i64::MAX as u64;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| {
            v.as_u64().or_else(|| {
                v.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0 && *f < MAX_TIMESTAMP_MS as f64)
                    .map(|f| f as u64)
            })
        })
        .filter(|t| *t <= MAX_TIMESTAMP_MS))
}

// ============================================================================
// UPDATES (peer -> relay)
// ============================================================================

/// The local pose as published every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "t")]
    pub timestamp_ms: u64,

    #[serde(rename = "p")]
    pub position: [f64; 3],

    #[serde(rename = "q")]
    pub orientation: [f64; 4],
}

impl UpdateMessage {
    pub fn from_pose(pose: &Pose, timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            position: pose.position_to_wire(),
            orientation: pose.orientation_to_wire(),
        }
    }

    /// The published pose, if both parts are usable.
    pub fn pose(&self) -> Option<Pose> {
        Pose::from_wire(self.position, self.orientation)
    }

    pub fn to_envelope(&self) -> Result<EventEnvelope, ProtocolError> {
        Ok(EventEnvelope::new(EVENT_UPDATE, serde_json::to_value(self)?))
    }

    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, ProtocolError> {
        if !envelope.is(EVENT_UPDATE) {
            return Err(ProtocolError::UnknownEvent(envelope.name.clone()));
        }
        UpdateMessage::deserialize(&envelope.payload)
            .map_err(|e| ProtocolError::malformed(EVENT_UPDATE, e))
    }
}

impl From<UpdateMessage> for SnapshotMessage {
    fn from(update: UpdateMessage) -> Self {
        Self {
            timestamp_ms: Some(update.timestamp_ms),
            position: Some(update.position),
            orientation: Some(update.orientation),
        }
    }
}

// ============================================================================
// INBOUND EVENTS
// ============================================================================

/// A decoded relay -> peer event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connect,
    Disconnect,
    /// The relay assigned the local identifier
    AssignedId(PeerId),
    /// Snapshot of every known peer
    Clients(SnapshotBatch),
    /// A peer left
    RemoveClient(PeerId),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Connect => EVENT_CONNECT,
            InboundEvent::Disconnect => EVENT_DISCONNECT,
            InboundEvent::AssignedId(_) => EVENT_ID,
            InboundEvent::Clients(_) => EVENT_CLIENTS,
            InboundEvent::RemoveClient(_) => EVENT_REMOVE_CLIENT,
        }
    }

    /// Decodes an envelope.
    ///
    /// Individual `clients` entries that cannot be decoded are skipped with a
    /// warning; the rest of the batch still goes through.
    pub fn decode(envelope: &EventEnvelope) -> Result<Self, ProtocolError> {
        match envelope.name.as_str() {
            EVENT_CONNECT => Ok(InboundEvent::Connect),
            EVENT_DISCONNECT => Ok(InboundEvent::Disconnect),
            EVENT_ID => decode_peer_id(EVENT_ID, &envelope.payload).map(InboundEvent::AssignedId),
            EVENT_REMOVE_CLIENT => {
                decode_peer_id(EVENT_REMOVE_CLIENT, &envelope.payload).map(InboundEvent::RemoveClient)
            }
            EVENT_CLIENTS => decode_batch(&envelope.payload).map(InboundEvent::Clients),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Encodes the event as the relay sends it.
    pub fn encode(&self) -> Result<EventEnvelope, ProtocolError> {
        let envelope = match self {
            InboundEvent::Connect => EventEnvelope::bare(EVENT_CONNECT),
            InboundEvent::Disconnect => EventEnvelope::bare(EVENT_DISCONNECT),
            InboundEvent::AssignedId(id) => EventEnvelope::new(EVENT_ID, id.as_str().into()),
            InboundEvent::RemoveClient(id) => EventEnvelope::new(EVENT_REMOVE_CLIENT, id.as_str().into()),
            InboundEvent::Clients(batch) => EventEnvelope::new(EVENT_CLIENTS, serde_json::to_value(batch)?),
        };
        Ok(envelope)
    }
}

fn decode_peer_id(event: &str, payload: &serde_json::Value) -> Result<PeerId, ProtocolError> {
    match payload.as_str() {
        Some(id) if !id.is_empty() => Ok(PeerId::new(id)),
        Some(_) => Err(ProtocolError::malformed(event, "empty peer id")),
        None => Err(ProtocolError::malformed(event, "expected a string peer id")),
    }
}

fn decode_batch(payload: &serde_json::Value) -> Result<SnapshotBatch, ProtocolError> {
    let entries = payload
        .as_object()
        .ok_or_else(|| ProtocolError::malformed(EVENT_CLIENTS, "expected an object"))?;

    let mut batch = SnapshotBatch::new();
    for (id, raw) in entries {
        if id.is_empty() {
            warn!("Skipping snapshot entry with empty peer id");
            continue;
        }
        match SnapshotMessage::deserialize(raw) {
            Ok(snapshot) => {
                batch.insert(PeerId::new(id.as_str()), snapshot);
            }
            Err(e) => warn!("Skipping malformed snapshot for {}: {}", id, e),
        }
    }
    Ok(batch)
}
