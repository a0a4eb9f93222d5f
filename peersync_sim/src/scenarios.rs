//! Scenario catalog: who joins, who leaves, and what breaks when.

use crate::relay::RelayConfig;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Peers join one after another, one leaves halfway through
    JoinLeave,

    /// Everyone present from the start, perfect network
    SteadyState,

    /// One peer joins near the end and has to catch up
    LateJoiner,

    /// The relay leaves out position/orientation fields at random
    SparseFields,

    /// One peer's link is cut and comes back under a new id
    LinkFlap,

    /// Uplink latency, jitter and a lossy link
    Jitter,

    /// Many peers with random churn
    Crowd,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::JoinLeave,
            ScenarioId::SteadyState,
            ScenarioId::LateJoiner,
            ScenarioId::SparseFields,
            ScenarioId::LinkFlap,
            ScenarioId::Jitter,
            ScenarioId::Crowd,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::JoinLeave => "join_leave",
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::LateJoiner => "late_joiner",
            ScenarioId::SparseFields => "sparse_fields",
            ScenarioId::LinkFlap => "link_flap",
            ScenarioId::Jitter => "jitter",
            ScenarioId::Crowd => "crowd",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::JoinLeave => "Staggered joins, one departure, verify proxies come and go",
            ScenarioId::SteadyState => "All peers from t=0, verify proxies track their owners",
            ScenarioId::LateJoiner => "A peer joins 3s before the end and must see everyone",
            ScenarioId::SparseFields => "40% of snapshot fields dropped, verify partial retargeting",
            ScenarioId::LinkFlap => "Sever one link for 20% of the run, verify removal and re-entry",
            ScenarioId::Jitter => "60ms +/- 25ms uplink delay, one slow link, one lossy link",
            ScenarioId::Crowd => "24 peers, random departures and late arrivals",
        }
    }

    /// Builds the timeline for `num_peers` peers over `duration_secs`.
    pub fn plan(&self, num_peers: usize, duration_secs: f64) -> ScenarioPlan {
        let n = num_peers.max(2);
        let d = duration_secs.max(MIN_DURATION_SECS);
        let mut plan = ScenarioPlan::new(*self, d);

        match self {
            ScenarioId::JoinLeave => {
                plan.initial_peers = 1;
                for i in 1..n {
                    plan.at(0.5 * i as f64, ScriptAction::Join);
                }
                plan.at(d * 0.5, ScriptAction::Leave(1));
            }
            ScenarioId::SteadyState => {
                plan.initial_peers = n;
            }
            ScenarioId::LateJoiner => {
                plan.initial_peers = n - 1;
                plan.at(d - 3.0, ScriptAction::Join);
            }
            ScenarioId::SparseFields => {
                plan.initial_peers = n;
                plan.relay.field_drop_rate = 0.4;
                plan.lag_budget_secs = 1.0;
            }
            ScenarioId::LinkFlap => {
                plan.initial_peers = n;
                plan.at(d * 0.3, ScriptAction::Sever(0));
                plan.at(d * 0.5, ScriptAction::Restore(0));
            }
            ScenarioId::Jitter => {
                plan.initial_peers = n;
                plan.relay.base_latency_ms = 60;
                plan.relay.latency_jitter_ms = 25.0;
                plan.at(0.0, ScriptAction::SetLinkLatency(0, 150));
                plan.at(0.0, ScriptAction::SetLinkLoss(1, 0.2));
                plan.lag_budget_secs = 1.0;
            }
            ScenarioId::Crowd => {
                plan.initial_peers = n.max(24);
                plan.at(d * 0.4, ScriptAction::LeaveRandom);
                plan.at(d * 0.5, ScriptAction::LeaveRandom);
                plan.at(d * 0.55, ScriptAction::Join);
                plan.at(d * 0.55, ScriptAction::Join);
                plan.at(d * 0.6, ScriptAction::LeaveRandom);
            }
        }

        plan
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "join_leave" | "joinleave" => Ok(ScenarioId::JoinLeave),
            "steady_state" | "steadystate" | "steady" => Ok(ScenarioId::SteadyState),
            "late_joiner" | "latejoiner" => Ok(ScenarioId::LateJoiner),
            "sparse_fields" | "sparsefields" | "sparse" => Ok(ScenarioId::SparseFields),
            "link_flap" | "linkflap" | "flap" => Ok(ScenarioId::LinkFlap),
            "jitter" => Ok(ScenarioId::Jitter),
            "crowd" => Ok(ScenarioId::Crowd),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

/// Shortest run that still leaves joins and restores time to settle.
pub const MIN_DURATION_SECS: f64 = 8.0;

/// Something that happens to the world at a scripted time.
///
/// Peer indices count joins in order, starting at 0 for the first initial peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptAction {
    Join,
    Leave(usize),
    /// Leave with a peer picked by the simulation RNG
    LeaveRandom,
    Sever(usize),
    Restore(usize),
    SetLinkLatency(usize, u64),
    SetLinkLoss(usize, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    pub at_secs: f64,
    pub action: ScriptAction,
}

/// Everything the runner needs to play a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub scenario: ScenarioId,
    pub duration_secs: f64,
    pub initial_peers: usize,
    /// Relay settings; the runner fills in the seed
    pub relay: RelayConfig,
    /// Steps sorted by time
    pub script: Vec<ScriptStep>,
    /// How far behind its owner a proxy may trail, in seconds of motion
    pub lag_budget_secs: f64,
}

impl ScenarioPlan {
    fn new(scenario: ScenarioId, duration_secs: f64) -> Self {
        Self {
            scenario,
            duration_secs,
            initial_peers: 0,
            relay: RelayConfig::default(),
            script: Vec::new(),
            lag_budget_secs: 0.6,
        }
    }

    fn at(&mut self, at_secs: f64, action: ScriptAction) {
        self.script.push(ScriptStep { at_secs, action });
        // Stable sort keeps same-time steps in insertion order
        self.script.sort_by(|a, b| a.at_secs.total_cmp(&b.at_secs));
    }

    /// Peers that ever exist during the run.
    pub fn total_peers(&self) -> usize {
        self.initial_peers
            + self
                .script
                .iter()
                .filter(|s| s.action == ScriptAction::Join)
                .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert!("nope".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_plans_are_time_ordered_and_in_range() {
        for scenario in ScenarioId::all() {
            let plan = scenario.plan(4, 10.0);
            assert!(plan.initial_peers >= 1, "{}", scenario);
            let times: Vec<f64> = plan.script.iter().map(|s| s.at_secs).collect();
            assert!(times.windows(2).all(|w| w[0] <= w[1]), "{}", scenario);
            assert!(times.iter().all(|t| *t >= 0.0 && *t < plan.duration_secs), "{}", scenario);
        }
    }

    #[test]
    fn test_short_durations_are_stretched() {
        let plan = ScenarioId::LateJoiner.plan(4, 1.0);
        assert_eq!(plan.duration_secs, MIN_DURATION_SECS);
        assert_eq!(plan.script[0].at_secs, MIN_DURATION_SECS - 3.0);
    }

    #[test]
    fn test_join_leave_counts() {
        let plan = ScenarioId::JoinLeave.plan(5, 10.0);
        assert_eq!(plan.initial_peers, 1);
        assert_eq!(plan.total_peers(), 5);
        assert!(plan.script.contains(&ScriptStep {
            at_secs: 5.0,
            action: ScriptAction::Leave(1),
        }));
    }
}
