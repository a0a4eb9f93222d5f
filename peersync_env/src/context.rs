//! The environment a sync session runs in.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock and task spawning as seen by a `SyncSession`.
///
/// A session never touches `std::time` or `tokio::spawn` directly, so the
/// same publish/frame loop runs on Tokio and on the simulator's virtual clock.
///
/// - `TokioContext` (this crate) follows `tokio::time`
/// - `SimContext` (peersync_sim) only moves when the runner ticks it
#[async_trait]
pub trait SyncContext: Send + Sync + 'static {
    /// Monotonic time since the context was created. Drives the publish and
    /// frame cadences.
    fn now(&self) -> Duration;

    /// Wall-clock time. Simulated contexts offset their virtual clock from a
    /// fixed epoch.
    fn system_time(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch, as stamped into outbound `t` fields
    /// and compared against inbound ones for latency.
    fn wall_clock_ms(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Waits for `duration`; a virtual clock just advances.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Seed the context was built from, 0 when unseeded.
    fn seed(&self) -> u64;
}
