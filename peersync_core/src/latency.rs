//! Per-peer latency bookkeeping for the diagnostics overlay.
//!
//! Latency here is simply `now - t`, where `t` is the wall-clock stamp of the
//! peer's last publish. It mixes one-way delay, relay cadence and clock skew
//! between machines, so it can be negative. It never feeds the motion model.

use crate::protocol::SnapshotBatch;
use peersync_env::PeerId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Running latency figures for one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub last_ms: i64,
    pub min_ms: i64,
    pub max_ms: i64,
    /// Exponentially weighted mean
    pub mean_ms: f64,
    pub samples: u64,
}

impl LatencyStats {
    fn first(sample_ms: i64) -> Self {
        Self {
            last_ms: sample_ms,
            min_ms: sample_ms,
            max_ms: sample_ms,
            mean_ms: sample_ms as f64,
            samples: 1,
        }
    }

    fn record(&mut self, sample_ms: i64, smoothing: f64) {
        self.last_ms = sample_ms;
        self.min_ms = self.min_ms.min(sample_ms);
        self.max_ms = self.max_ms.max(sample_ms);
        self.mean_ms += smoothing * (sample_ms as f64 - self.mean_ms);
        self.samples += 1;
    }
}

/// `now_ms - t`, or `None` when the gap does not fit in an `i64`.
fn latency_ms(now_ms: u64, t: u64) -> Option<i64> {
    i64::try_from(i128::from(now_ms) - i128::from(t)).ok()
}

/// Aggregate over every tracked peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub peers: usize,
    pub mean_ms: f64,
    pub max_ms: i64,
}

/// Latency table refreshed on every snapshot batch.
#[derive(Debug, Clone)]
pub struct LatencyBoard {
    smoothing: f64,
    stats: BTreeMap<PeerId, LatencyStats>,
    /// Entries of the most recent batch, `None` when it carried no `t`
    latest: Vec<(PeerId, Option<i64>)>,
}

impl LatencyBoard {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            stats: BTreeMap::new(),
            latest: Vec::new(),
        }
    }

    /// Records `now_ms - t` for every stamped entry of the batch.
    pub fn record_batch(&mut self, batch: &SnapshotBatch, now_ms: u64) {
        self.latest.clear();
        for (peer, snapshot) in batch {
            let sample = snapshot.timestamp_ms.and_then(|t| latency_ms(now_ms, t));

            if let Some(ms) = sample {
                match self.stats.get_mut(peer) {
                    Some(stats) => stats.record(ms, self.smoothing),
                    None => {
                        self.stats.insert(peer.clone(), LatencyStats::first(ms));
                    }
                }
            }
            self.latest.push((peer.clone(), sample));
        }
    }

    /// Drops everything known about a departed peer.
    pub fn forget(&mut self, peer: &PeerId) {
        self.stats.remove(peer);
        self.latest.retain(|(id, _)| id != peer);
    }

    pub fn get(&self, peer: &PeerId) -> Option<&LatencyStats> {
        self.stats.get(peer)
    }

    /// One `"<peer> <ms>ms"` line per entry of the latest batch.
    pub fn lines(&self) -> Vec<String> {
        self.latest
            .iter()
            .map(|(peer, sample)| match sample {
                Some(ms) => format!("{} {}ms", peer, ms),
                None => format!("{} -", peer),
            })
            .collect()
    }

    pub fn summary(&self) -> Option<LatencySummary> {
        if self.stats.is_empty() {
            return None;
        }
        let peers = self.stats.len();
        let mean_ms = self.stats.values().map(|s| s.mean_ms).sum::<f64>() / peers as f64;
        let max_ms = self.stats.values().map(|s| s.max_ms).max().unwrap_or(0);
        Some(LatencySummary { peers, mean_ms, max_ms })
    }

    pub fn clear(&mut self) {
        self.stats.clear();
        self.latest.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SnapshotMessage;
    use approx::assert_relative_eq;

    fn batch(entries: &[(&str, Option<u64>)]) -> SnapshotBatch {
        entries
            .iter()
            .map(|(id, t)| {
                let snap = SnapshotMessage {
                    timestamp_ms: *t,
                    ..SnapshotMessage::default()
                };
                (PeerId::new(*id), snap)
            })
            .collect()
    }

    #[test]
    fn test_lines_follow_latest_batch() {
        let mut board = LatencyBoard::new(0.5);
        board.record_batch(&batch(&[("a", Some(900)), ("b", None)]), 1000);
        assert_eq!(board.lines(), vec!["a 100ms".to_string(), "b -".to_string()]);

        board.record_batch(&batch(&[("a", Some(980))]), 1000);
        assert_eq!(board.lines(), vec!["a 20ms".to_string()]);
    }

    #[test]
    fn test_stats_accumulate() {
        let mut board = LatencyBoard::new(0.5);
        board.record_batch(&batch(&[("a", Some(900))]), 1000); // 100
        board.record_batch(&batch(&[("a", Some(1980))]), 2000); // 20

        let stats = board.get(&PeerId::new("a")).unwrap();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.min_ms, 20);
        assert_eq!(stats.max_ms, 100);
        assert_eq!(stats.last_ms, 20);
        assert_relative_eq!(stats.mean_ms, 60.0, epsilon = 1e-9);
    }

    #[test]
    fn test_clock_skew_gives_negative_latency() {
        let mut board = LatencyBoard::new(0.2);
        board.record_batch(&batch(&[("ahead", Some(1050))]), 1000);
        assert_eq!(board.get(&PeerId::new("ahead")).unwrap().last_ms, -50);
    }

    #[test]
    fn test_out_of_range_gap_reads_as_absent() {
        let mut board = LatencyBoard::new(0.2);
        board.record_batch(&batch(&[("far", Some(u64::MAX)), ("ok", Some(990))]), 1000);

        assert!(board.get(&PeerId::new("far")).is_none());
        assert_eq!(board.lines(), vec!["far -".to_string(), "ok 10ms".to_string()]);

        // Huge but representable gaps are kept as-is
        assert_eq!(latency_ms(1_700_000_000_000, 1u64 << 63), Some(1_700_000_000_000 - i64::MAX - 1));
        assert_eq!(latency_ms(u64::MAX, 0), None);
    }

    #[test]
    fn test_summary_serializes() {
        let mut board = LatencyBoard::new(1.0);
        board.record_batch(&batch(&[("a", Some(960))]), 1000);
        let json = serde_json::to_value(board.summary().unwrap()).unwrap();
        assert_eq!(json["peers"], 1);
        assert_eq!(json["max_ms"], 40);
    }

    #[test]
    fn test_forget_and_summary() {
        let mut board = LatencyBoard::new(1.0);
        board.record_batch(&batch(&[("a", Some(990)), ("b", Some(970))]), 1000);

        let summary = board.summary().unwrap();
        assert_eq!(summary.peers, 2);
        assert_eq!(summary.max_ms, 30);
        assert_relative_eq!(summary.mean_ms, 20.0, epsilon = 1e-9);

        board.forget(&PeerId::new("b"));
        assert!(board.get(&PeerId::new("b")).is_none());
        assert_eq!(board.lines(), vec!["a 10ms".to_string()]);

        board.clear();
        assert!(board.summary().is_none());
    }
}
