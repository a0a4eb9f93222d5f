//! Virtual-clock `SyncContext` for deterministic runs.

use async_trait::async_trait;
use peersync_env::SyncContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock reading at virtual time zero (2024-01-01T00:00:00Z).
const SIM_EPOCH_SECS: u64 = 1_704_067_200;

/// Time and randomness for one simulated world.
///
/// Clones share the clock and the RNG, so every session and the runner see
/// the same instant. Time only moves through `advance_time`/`set_time` (or a
/// `sleep`, which advances it by the requested amount).
#[derive(Clone)]
pub struct SimContext {
    seed: u64,
    elapsed_ns: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Moves the clock forward.
    pub fn advance_time(&self, by: Duration) {
        self.elapsed_ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jumps the clock to `elapsed_ns` since start.
    pub fn set_time(&self, elapsed_ns: u64) {
        self.elapsed_ns.store(elapsed_ns, Ordering::SeqCst);
    }

    pub fn time_ns(&self) -> u64 {
        self.elapsed_ns.load(Ordering::SeqCst)
    }

    /// Draws from the world RNG.
    ///
    /// Scenario decisions (who leaves, when) go through here so they replay
    /// from the seed.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        // A poisoned lock still holds a usable RNG
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

#[async_trait]
impl SyncContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(SIM_EPOCH_SECS) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, seed = self.seed, "spawning simulated task");
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_clock_only_moves_when_told() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));

        ctx.set_time(250_000_000);
        assert_eq!(ctx.now(), Duration::from_millis(250));
    }

    #[test]
    fn test_wall_clock_tracks_virtual_time() {
        let ctx = SimContext::new(42);
        let t0 = ctx.wall_clock_ms();
        assert_eq!(t0, SIM_EPOCH_SECS * 1000);

        ctx.advance_time(Duration::from_millis(250));
        assert_eq!(ctx.wall_clock_ms() - t0, 250);
    }

    #[tokio::test]
    async fn test_sleep_advances_clock() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.now(), Duration::from_millis(40));
    }

    #[test]
    fn test_rng_replays_from_seed() {
        let a: u64 = SimContext::new(42).with_rng(|rng| rng.gen());
        let b: u64 = SimContext::new(42).with_rng(|rng| rng.gen());
        let c: u64 = SimContext::new(43).with_rng(|rng| rng.gen());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_clones_share_clock() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx2.now(), Duration::from_secs(5));
        assert_eq!(ctx2.seed(), 42);
    }
}
