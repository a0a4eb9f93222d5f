//! PeerSync Deterministic Simulation Testing (DST) Harness
//!
//! Runs many `SyncSession`s against an in-process relay on one virtual
//! clock, so every join, leave and link fault replays exactly from a seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: virtual clock advanced in fixed ticks by the runner
//! - **Network**: in-memory links with configurable latency, jitter, loss
//!   and severing
//! - **Randomness**: motion paths, ids and faults derived from a single seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                        │
//! │                                                             │
//! │  ┌─────────┐   update    ┌──────────┐   clients / id /      │
//! │  │ Session │────────────►│ SimRelay │   removeClient        │
//! │  │ peer-0  │◄────────────│          │──────────┐            │
//! │  └─────────┘             └──────────┘          ▼            │
//! │       ▲                       ▲           ┌─────────┐       │
//! │       │ OrbitSource           │ faults    │ Session │ ...   │
//! │       │                 SimLinkController │ peer-1  │       │
//! │  ┌────┴──────────────────────────┐        └─────────┘       │
//! │  │  SimContext (virtual clock)   │                          │
//! │  └───────────────────────────────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use peersync_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4)
//!     .with_duration(10.0)
//!     .run(ScenarioId::LinkFlap);
//! assert!(result.passed);
//! ```

mod context;
mod transport;
mod relay;
mod motion;
mod scene;
mod exporter;
mod runner;
mod live;
pub mod scenarios;

pub use context::SimContext;
pub use transport::{LinkId, SimLinkController, SimTransport};
pub use relay::{RelayConfig, RelayMetrics, SimRelay};
pub use motion::{OrbitPath, OrbitSource};
pub use scene::{ProxyHandle, ProxyNode, RecordingScene};
pub use exporter::{EventLevel, ObserverFrame, PeerPosition, SimEvent, SimExport, SimFrame};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use live::{run_live, LivePeerReport, LiveReport};
