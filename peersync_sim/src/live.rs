//! Live mode: the relay and every session as Tokio tasks on the real clock.

use crate::motion::{OrbitPath, OrbitSource};
use crate::relay::{RelayConfig, RelayMetrics, SimRelay};
use crate::scene::RecordingScene;
use crate::transport::SimLinkController;

use peersync_core::{SessionSummary, SyncConfig, SyncError, SyncSession};
use peersync_env::{PeerId, SyncContext, TokioContext};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How often the relay task wakes up.
const RELAY_STEP: Duration = Duration::from_millis(5);

/// What one peer ended up with.
#[derive(Debug, Clone, Serialize)]
pub struct LivePeerReport {
    pub name: String,
    pub id: Option<PeerId>,
    pub summary: SessionSummary,
    pub latency: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveReport {
    pub peers: Vec<LivePeerReport>,
    pub relay: RelayMetrics,
}

impl LiveReport {
    /// Every peer got an id and ended up seeing all the others.
    pub fn passed(&self) -> bool {
        let expected = self.peers.len().saturating_sub(1);
        self.peers
            .iter()
            .all(|p| p.id.is_some() && p.summary.peers == expected && p.summary.decode_errors == 0)
    }
}

/// Runs `num_peers` sessions against one relay for `run_for`.
///
/// Fails before anything is spawned if `sync` does not validate.
pub async fn run_live(
    seed: u64,
    num_peers: usize,
    run_for: Duration,
    relay_config: RelayConfig,
    sync: SyncConfig,
) -> Result<LiveReport, SyncError> {
    sync.validate()?;
    let context = TokioContext::shared();
    let mut relay = SimRelay::new(
        RelayConfig { seed, ..relay_config },
        Arc::new(SimLinkController::new()),
    );
    let transports: Vec<_> = (0..num_peers).map(|_| relay.connect()).collect();

    info!("Live run: {} peers for {:?}", num_peers, run_for);

    // Outlives the sessions by a couple of steps so their last updates land
    let relay_ctx = Arc::clone(&context);
    let relay_deadline = context.now() + run_for + RELAY_STEP * 2;
    let relay_task = tokio::spawn(async move {
        while relay_ctx.now() < relay_deadline {
            relay.step(relay_ctx.now().as_millis() as u64);
            relay_ctx.sleep(RELAY_STEP).await;
        }
        relay.metrics().clone()
    });

    let mut paths = ChaCha8Rng::seed_from_u64(seed);
    let mut handles = Vec::with_capacity(num_peers);
    for (index, transport) in transports.into_iter().enumerate() {
        let ctx = Arc::clone(&context);
        let config = SyncConfig {
            name: format!("peer-{}", index),
            ..sync.clone()
        };
        let source = OrbitSource::new(Arc::clone(&context), OrbitPath::random(&mut paths));

        handles.push(tokio::spawn(async move {
            let mut session = SyncSession::new(ctx, transport, RecordingScene::new(), config)?;
            let summary = session.run(&source, run_for).await;
            let report = LivePeerReport {
                name: session.config.name.clone(),
                id: session.local_id().cloned(),
                summary,
                latency: session.latency_lines(),
            };
            session.shutdown();
            Ok::<_, SyncError>(report)
        }));
    }

    let mut peers = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Ok(report)) => peers.push(report),
            Ok(Err(e)) => error!("Peer session rejected: {}", e),
            Err(e) => error!("Peer task failed: {}", e),
        }
    }
    let relay = relay_task.await.unwrap_or_else(|e| {
        error!("Relay task failed: {}", e);
        RelayMetrics::default()
    });

    Ok(LiveReport { peers, relay })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_live_peers_discover_each_other() {
        let report = run_live(
            1,
            3,
            Duration::from_secs(2),
            RelayConfig::default(),
            SyncConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.peers.len(), 3);
        assert!(report.passed(), "{:?}", report);
        for peer in &report.peers {
            // ~40 publish ticks in 2s, minus the one before the id arrives
            assert!(peer.summary.updates_sent >= 35);
            assert!(peer.summary.frames >= 110);
            assert_eq!(peer.latency.len(), 3);
        }
        assert!(report.relay.batches_sent >= 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_peer_sees_nobody() {
        let report = run_live(
            2,
            1,
            Duration::from_millis(500),
            RelayConfig::default(),
            SyncConfig::default(),
        )
        .await
        .unwrap();

        assert!(report.passed());
        assert_eq!(report.peers[0].summary.peers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_spawns_nothing() {
        let sync = SyncConfig {
            publish_period_ms: 0,
            ..SyncConfig::default()
        };
        let result = run_live(3, 2, Duration::from_millis(200), RelayConfig::default(), sync).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
