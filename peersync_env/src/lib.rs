//! PeerSync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the PeerSync core
//! to run against a **Production** runtime (tokio) or a **Simulation**
//! (virtual clock, in-memory relay).
//!
//! # Core Concept: Injected Collaborators
//!
//! The synchronization core never reaches for a global clock or socket.
//! Everything it touches from the outside world is passed in:
//! - Time (`now()`, `wall_clock_ms()`, `sleep()`)
//! - Transport (`emit()`, `recv()`), carrying named events with JSON payloads
//!
//! # Example
//!
//! ```ignore
//! use peersync_env::{SyncContext, Transport};
//!
//! async fn pump<Ctx: SyncContext, Net: Transport>(ctx: &Ctx, net: &Net) {
//!     loop {
//!         tokio::select! {
//!             event = net.recv() => handle(event),
//!             _ = ctx.sleep(Duration::from_millis(50)) => publish(),
//!         }
//!     }
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;

pub use context::SyncContext;
pub use transport::{Transport, LinkController};
pub use types::{PeerId, EventEnvelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
