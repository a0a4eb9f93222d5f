//! `peersync-sim`: drive sync sessions against the in-process relay.
//!
//! `run` replays scenarios on the virtual clock (the default), `export`
//! records one of them frame by frame, `live` puts the same sessions on Tokio.

use clap::{Parser, Subcommand};
use peersync_core::SyncConfig;
use peersync_sim::scenarios::ScenarioId;
use peersync_sim::{
    run_live, RelayConfig, ScenarioMetrics, ScenarioResult, ScenarioRunner, SimExport,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RULE: &str = "────────────────────────────────────────────────────";

#[derive(Parser, Debug)]
#[command(name = "peersync-sim")]
#[command(version, about = "Deterministic and live runs of the PeerSync sync core", long_about = None)]
struct Cli {
    /// Base seed; 0 picks one from the clock
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Peers per run (scenarios may add more)
    #[arg(short, long, default_value_t = 4)]
    peers: usize,

    /// Seconds of simulated (or, with `live`, real) time
    #[arg(short, long, default_value_t = 10.0)]
    duration: f64,

    /// Scenarios for `run`: a name or "all"
    #[arg(short = 'S', long, default_value = "all")]
    scenario: Selection,

    /// Consecutive seeds to sweep, starting at --seed
    #[arg(long, default_value_t = 1)]
    seeds: usize,

    /// JSON file with session settings (SyncConfig)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print a JSON report instead of log lines
    #[arg(long)]
    json: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the selected scenarios for every seed (default)
    Run,
    /// Run one scenario and write its frames to a JSON file
    Export {
        scenario: ScenarioId,
        /// Output file
        #[arg(short, long, default_value = "peersync_export.json")]
        output: PathBuf,
    },
    /// Run the sessions as Tokio tasks on the real clock
    Live,
    /// List the scenario catalog
    List,
}

/// `--scenario` value: one scenario, or all of them.
#[derive(Debug, Clone)]
struct Selection(Vec<ScenarioId>);

impl FromStr for Selection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self(ScenarioId::all()));
        }
        s.parse().map(|id| Self(vec![id])).map_err(|e: String| {
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            format!("{} (expected one of: {}, all)", e, names.join(", "))
        })
    }
}

/// One scenario run as it appears in `--json` output.
#[derive(Debug, Serialize)]
struct RunRecord<'a> {
    scenario: &'static str,
    seed: u64,
    passed: bool,
    ticks: u64,
    time_secs: f64,
    peers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<&'a str>,
    metrics: &'a ScenarioMetrics,
}

impl<'a> From<&'a ScenarioResult> for RunRecord<'a> {
    fn from(r: &'a ScenarioResult) -> Self {
        Self {
            scenario: r.scenario.name(),
            seed: r.seed,
            passed: r.passed,
            ticks: r.total_ticks,
            time_secs: r.final_time_secs,
            peers: r.final_peer_count,
            failure_reason: r.failure_reason.as_deref(),
            metrics: &r.metrics,
        }
    }
}

#[derive(Debug, Serialize)]
struct SweepReport<'a> {
    total: usize,
    passed: usize,
    failed: usize,
    results: Vec<RunRecord<'a>>,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

fn load_sync_config(path: Option<&Path>) -> Result<SyncConfig, String> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let config = SyncConfig::from_json_file(path)
        .map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
    info!("Loaded session config from {}", path.display());
    Ok(config)
}

fn resolve_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(42)
}

fn outcome_line(result: &ScenarioResult) {
    if result.passed {
        info!("✓ {} (seed={}) passed", result.scenario, result.seed);
    } else {
        error!(
            "✗ {} (seed={}) failed: {}",
            result.scenario,
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn sweep(cli: &Cli, base_seed: u64, sync: &SyncConfig) -> bool {
    let results: Vec<ScenarioResult> = (0..cli.seeds as u64)
        .map(|offset| base_seed.wrapping_add(offset))
        .flat_map(|seed| {
            let runner = ScenarioRunner::new(seed, cli.peers)
                .with_duration(cli.duration)
                .with_sync_config(sync.clone());
            cli.scenario.0.iter().map(move |scenario| runner.run(*scenario)).collect::<Vec<_>>()
        })
        .inspect(|result| {
            if !cli.json {
                outcome_line(result);
            }
        })
        .collect();

    let failed: Vec<&ScenarioResult> = results.iter().filter(|r| !r.passed).collect();

    if cli.json {
        print_json(&SweepReport {
            total: results.len(),
            passed: results.len() - failed.len(),
            failed: failed.len(),
            results: results.iter().map(RunRecord::from).collect(),
        });
    } else {
        info!("{}", RULE);
        if failed.is_empty() {
            info!("All {} runs passed", results.len());
        } else {
            error!("{} of {} runs failed:", failed.len(), results.len());
            for result in &failed {
                error!("  {} --seed {}", result.scenario, result.seed);
            }
        }
    }
    failed.is_empty()
}

fn export(cli: &Cli, scenario: ScenarioId, output: &Path, seed: u64, sync: SyncConfig) -> bool {
    let mut export = SimExport::new(scenario.name(), seed);
    let result = ScenarioRunner::new(seed, cli.peers)
        .with_duration(cli.duration)
        .with_sync_config(sync)
        .run_with_export(scenario, Some(&mut export));

    match export.write_to_file(output) {
        Ok(()) => info!("Wrote {} frames to {}", export.frames.len(), output.display()),
        Err(e) => {
            error!("Failed to write {}: {}", output.display(), e);
            return false;
        }
    }

    if cli.json {
        print_json(&RunRecord::from(&result));
    } else {
        outcome_line(&result);
    }
    result.passed
}

fn live(cli: &Cli, seed: u64, sync: SyncConfig) -> bool {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start Tokio runtime: {}", e);
            return false;
        }
    };

    let run_for = Duration::from_secs_f64(cli.duration.max(0.0));
    let report = match runtime.block_on(run_live(
        seed,
        cli.peers.max(1),
        run_for,
        RelayConfig::default(),
        sync,
    )) {
        Ok(report) => report,
        Err(e) => {
            error!("Live run not started: {}", e);
            return false;
        }
    };
    let passed = report.passed();

    if cli.json {
        print_json(&report);
        return passed;
    }

    for peer in &report.peers {
        info!(
            "{} ({}) | peers={} sent={} frames={}",
            peer.name,
            peer.id.as_ref().map(|id| id.short()).unwrap_or("-"),
            peer.summary.peers,
            peer.summary.updates_sent,
            peer.summary.frames
        );
        for line in &peer.latency {
            info!("    {}", line);
        }
    }
    if passed {
        info!("Live run converged: every peer sees the other {}", report.peers.len().saturating_sub(1));
    } else {
        warn!("Live run did not converge on full membership");
    }
    passed
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::List) = cli.command {
        for scenario in ScenarioId::all() {
            println!("{:<14} {}", scenario.name(), scenario.description());
        }
        return ExitCode::SUCCESS;
    }

    let sync = match load_sync_config(cli.config.as_deref()) {
        Ok(sync) => sync,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    let seed = resolve_seed(cli.seed);

    if !cli.json {
        info!("peersync-sim v{} | seed={}", env!("CARGO_PKG_VERSION"), seed);
        info!("{}", RULE);
    }

    let ok = match &cli.command {
        Some(Commands::Export { scenario, output }) => export(&cli, *scenario, output, seed, sync),
        Some(Commands::Live) => live(&cli, seed, sync),
        Some(Commands::Run) | Some(Commands::List) | None => sweep(&cli, seed, &sync),
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
