//! JSON exporter for offline inspection of a run.
//!
//! One frame per sample: every peer's true position next to every
//! observer's proxies of it, plus the observer's latency overlay.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    pub time_sec: f64,
    /// Where each connected peer actually is.
    pub ground_truth: Vec<PeerPosition>,
    /// What each connected peer sees.
    pub observers: Vec<ObserverFrame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// A peer's position keyed by its short id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPosition {
    pub peer: String,
    pub position: [f64; 3],
}

impl PeerPosition {
    pub fn new(peer: impl Into<String>, pos: &Vector3<f64>) -> Self {
        Self {
            peer: peer.into(),
            position: [pos.x, pos.y, pos.z],
        }
    }

    pub fn vector(&self) -> Vector3<f64> {
        Vector3::from(self.position)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverFrame {
    pub observer: String,
    pub proxies: Vec<PeerPosition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub latency: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
}

/// Something the scenario script did: a join, a departure, a link fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub level: EventLevel,
    pub message: String,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Warn,
            message: message.into(),
        }
    }
}

/// Recorded run, written out as one pretty-printed JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    /// Time of the last frame.
    pub duration_sec: f64,
    pub frames: Vec<SimFrame>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_rms_error: Option<f64>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_owned(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            final_rms_error: None,
        }
    }

    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = self.duration_sec.max(frame.time_sec);
        self.frames.push(frame);
    }

    pub fn finalize(&mut self, passed: bool, rms_error: Option<f64>) {
        self.passed = passed;
        self.final_rms_error = rms_error;
    }

    /// Every scripted event in frame order, stamped with its frame time.
    pub fn timeline(&self) -> impl Iterator<Item = (f64, &SimEvent)> {
        self.frames
            .iter()
            .flat_map(|f| f.events.iter().map(move |e| (f.time_sec, e)))
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
