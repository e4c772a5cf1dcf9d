//! Validation scenarios for a two-core cross-triggered cluster
//!
//! Each scenario builds a fresh [`SimTarget`] and [`SmpController`] from the
//! session config, drives one run-control situation, and checks the states,
//! events and fabric accesses that result. The first configured cluster is
//! the one exercised.

use std::sync::Arc;

use eyre::{Result, bail, ensure, eyre};
use tracing::{debug, info};

use crate::config::{ClusterConfig, Config};
use crate::controller::SmpController;
use crate::coordinator::{OperationOutcome, OperationPath};
use crate::domain::{RunState, StopReason};
use crate::error::RunControlError;
use crate::fallback::FallbackPolicy;
use crate::notifier::{GroupEvent, RecordingSink};
use crate::sim::{SimOp, SimTarget};

/// Upper bound on the convergence timeout used by the timeout scenario
const TIMEOUT_SCENARIO_CAP_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    BringUp,
    GroupHalt,
    GroupResume,
    Breakpoint,
    PartialExamine,
    MissingCti,
    Timeout,
}

impl Scenario {
    pub fn all() -> Vec<Self> {
        vec![
            Self::BringUp,
            Self::GroupHalt,
            Self::GroupResume,
            Self::Breakpoint,
            Self::PartialExamine,
            Self::MissingCti,
            Self::Timeout,
        ]
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::BringUp => "Bring-up and CTI binding",
            Self::GroupHalt => "Group halt propagation",
            Self::GroupResume => "Group synchronized resume",
            Self::Breakpoint => "Breakpoint hit on one core",
            Self::PartialExamine => "Partial examination, unavailable core",
            Self::MissingCti => "Cluster member without CTI binding",
            Self::Timeout => "Core that never halts",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BringUp => write!(f, "bring-up"),
            Self::GroupHalt => write!(f, "group-halt"),
            Self::GroupResume => write!(f, "group-resume"),
            Self::Breakpoint => write!(f, "breakpoint"),
            Self::PartialExamine => write!(f, "partial-examine"),
            Self::MissingCti => write!(f, "missing-cti"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bring-up" | "a" => Ok(Self::BringUp),
            "group-halt" | "b" => Ok(Self::GroupHalt),
            "group-resume" | "c" => Ok(Self::GroupResume),
            "breakpoint" | "d" => Ok(Self::Breakpoint),
            "partial-examine" | "f" => Ok(Self::PartialExamine),
            "missing-cti" | "g" => Ok(Self::MissingCti),
            "timeout" | "h" => Ok(Self::Timeout),
            _ => Err(format!(
                "Unknown scenario: {}. Use: {}",
                s,
                Self::all().iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
            )),
        }
    }
}

/// Result of one scenario run
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub passed: bool,
    /// What was observed, or why the scenario failed
    pub detail: String,
}

/// Run one scenario against a simulated target built from `config`
pub fn run(scenario: Scenario, config: &Config) -> ScenarioOutcome {
    info!(%scenario, "Scenario started");
    let result = match scenario {
        Scenario::BringUp => bring_up(config),
        Scenario::GroupHalt => group_halt(config),
        Scenario::GroupResume => group_resume(config),
        Scenario::Breakpoint => breakpoint(config),
        Scenario::PartialExamine => partial_examine(config),
        Scenario::MissingCti => missing_cti(config),
        Scenario::Timeout => timeout(config),
    };
    let (passed, detail) = match result {
        Ok(detail) => (true, detail),
        Err(e) => (false, format!("{:#}", e)),
    };
    info!(%scenario, passed, %detail, "Scenario finished");
    ScenarioOutcome {
        scenario,
        passed,
        detail,
    }
}

struct Bench {
    sim: Arc<SimTarget>,
    sink: Arc<RecordingSink>,
    controller: SmpController,
    cluster: ClusterConfig,
}

impl Bench {
    fn new(config: &Config) -> Result<Self> {
        let cluster = config
            .clusters
            .first()
            .cloned()
            .ok_or_else(|| eyre!("config defines no cluster"))?;
        ensure!(
            cluster.members.len() >= 2,
            "cluster {} needs at least two cores",
            cluster.name
        );
        let sim = Arc::new(SimTarget::from_config(config));
        let sink = Arc::new(RecordingSink::new());
        let controller = SmpController::new(config, sim.clone(), sim.clone(), sink.clone())?;
        debug!(cluster = %cluster.name, "Bench::new: ready");
        Ok(Self {
            sim,
            sink,
            controller,
            cluster,
        })
    }

    fn first(&self) -> &str {
        &self.cluster.members[0]
    }

    fn last(&self) -> &str {
        &self.cluster.members[self.cluster.members.len() - 1]
    }

    fn examine_all(&self) -> Result<()> {
        for (core, result) in self.controller.examine_all() {
            result.map_err(|e| eyre!("examine {} failed: {}", core, e))?;
        }
        Ok(())
    }

    fn expect_all(&self, state: RunState) -> Result<()> {
        for core in &self.cluster.members {
            let actual = self.controller.status(core)?.run_state;
            ensure!(actual == state, "{} is {}, expected {}", core, actual, state);
        }
        Ok(())
    }

    /// The single stop event, checked against the expected primary
    fn expect_one_stop(&self, primary: &str) -> Result<GroupEvent> {
        let stops = self.sink.stops();
        ensure!(stops.len() == 1, "expected one group stop, got {}", stops.len());
        let stop = stops[0].clone();
        ensure!(
            stop.primary() == primary,
            "group stop attributed to {}, expected {}",
            stop.primary(),
            primary
        );
        ensure!(
            self.controller.status(primary)?.is_primary,
            "status does not report {} as primary",
            primary
        );
        Ok(stop)
    }

    /// Prepare the cluster's members without the CTI of its last member
    fn without_last_cti(config: &Config, policy: FallbackPolicy) -> Result<Config> {
        let mut config = config.clone();
        config.fallback_policy = policy;
        let cluster = config
            .clusters
            .first()
            .ok_or_else(|| eyre!("config defines no cluster"))?;
        let last = cluster
            .members
            .last()
            .cloned()
            .ok_or_else(|| eyre!("cluster {} has no members", cluster.name))?;
        for core in config.cores.iter_mut().filter(|c| c.name == last) {
            core.cti = None;
        }
        Ok(config)
    }
}

fn bring_up(config: &Config) -> Result<String> {
    let bench = Bench::new(config)?;
    bench.examine_all()?;
    for core in &bench.cluster.members {
        let record = bench
            .controller
            .registry()
            .core(core)
            .ok_or_else(|| eyre!("{} missing from registry", core))?;
        ensure!(record.examined, "{} not examined", core);
        ensure!(record.has_binding(), "{} has no CTI binding", core);
    }
    bench.expect_all(RunState::Running)?;
    ensure!(bench.sim.fabric_ops().is_empty(), "examination touched the trigger fabric");
    Ok(format!(
        "{} cores examined, halt on {} restart on {}",
        bench.cluster.members.len(),
        bench.cluster.channels.halt,
        bench.cluster.channels.restart
    ))
}

fn group_halt(config: &Config) -> Result<String> {
    let bench = Bench::new(config)?;
    bench.examine_all()?;
    bench.sim.set_latency(bench.last(), 2);

    let report = bench.controller.halt_core(bench.first())?.into_result()?;
    bench.expect_all(RunState::Halted)?;
    bench.expect_one_stop(bench.first())?;
    let pulses = bench.sim.pulses();
    ensure!(pulses.len() == 1, "expected one pulse, got {}", pulses.len());
    ensure!(report.path == OperationPath::CrossTriggered, "halt took the {:?} path", report.path);
    Ok(format!("cluster halted in {} ms", report.convergence.elapsed_ms))
}

fn group_resume(config: &Config) -> Result<String> {
    let bench = Bench::new(config)?;
    bench.examine_all()?;
    bench.controller.halt_core(bench.first())?.into_result()?;
    bench.sink.clear();
    bench.sim.clear_ops();

    let report = bench.controller.resume_core(bench.first())?.into_result()?;
    bench.expect_all(RunState::Running)?;
    ensure!(bench.sink.stops().is_empty(), "resume emitted a group stop");
    ensure!(bench.sink.runs().len() == 1, "expected one group run, got {}", bench.sink.runs().len());

    let ops = bench.sim.ops();
    let first_pulse = ops
        .iter()
        .position(|op| matches!(op, SimOp::Pulse { .. }))
        .ok_or_else(|| eyre!("resume issued no pulse"))?;
    let restores = ops[..first_pulse]
        .iter()
        .filter(|op| matches!(op, SimOp::Restore { .. }))
        .count();
    ensure!(
        restores == bench.cluster.members.len(),
        "only {} restorations completed before the restart pulse",
        restores
    );
    Ok(format!("cluster resumed in {} ms", report.convergence.elapsed_ms))
}

fn breakpoint(config: &Config) -> Result<String> {
    let bench = Bench::new(config)?;
    bench.examine_all()?;
    let hit = bench.last().to_string();
    bench.sim.hit_breakpoint(&hit);

    let reports = bench.controller.poll()?;
    ensure!(reports.len() == 1, "expected one group halt from poll, got {}", reports.len());
    bench.expect_all(RunState::Halted)?;
    let stop = bench.expect_one_stop(&hit)?;
    ensure!(
        matches!(
            stop,
            GroupEvent::GroupStop {
                reason: StopReason::Breakpoint,
                ..
            }
        ),
        "group stop does not carry the breakpoint reason"
    );

    ensure!(bench.controller.poll()?.is_empty(), "second poll reported the same stop again");
    Ok(format!("breakpoint on {} stopped the cluster", hit))
}

fn partial_examine(config: &Config) -> Result<String> {
    let bench = Bench::new(config)?;
    let missing = bench.last().to_string();
    bench.sim.fail_examine(&missing);
    let failed: Vec<String> = bench
        .controller
        .examine_all()
        .into_iter()
        .filter(|(_, r)| r.is_err())
        .map(|(core, _)| core)
        .collect();
    ensure!(failed == vec![missing.clone()], "unexpected examination failures: {:?}", failed);

    let report = bench.controller.halt_core(bench.first())?.into_result()?;
    ensure!(report.skipped.contains(&missing), "{} was not skipped", missing);
    ensure!(
        bench.controller.status(&missing)?.run_state == RunState::Unavailable,
        "{} not reported unavailable",
        missing
    );
    bench.expect_one_stop(bench.first())?;
    Ok(format!("{} skipped, {} halted", missing, report.participants.join(", ")))
}

fn missing_cti(config: &Config) -> Result<String> {
    let strict = Bench::new(&Bench::without_last_cti(config, FallbackPolicy::FailFast)?)?;
    let unbound = strict.last().to_string();
    strict.examine_all()?;
    match strict.controller.halt_cluster(&strict.cluster.name) {
        Err(RunControlError::MissingBinding { cores, .. }) => {
            ensure!(cores == vec![unbound.clone()], "error names {:?}, expected {}", cores, unbound);
        }
        Err(e) => bail!("expected a missing-binding error, got: {}", e),
        Ok(report) => bail!("halt succeeded on the {:?} path", report.path),
    }
    ensure!(strict.sim.ops().is_empty(), "fail-fast touched hardware");

    let lenient = Bench::new(&Bench::without_last_cti(config, FallbackPolicy::Sequential)?)?;
    lenient.examine_all()?;
    let report = lenient.controller.halt_core(lenient.first())?.into_result()?;
    ensure!(report.path == OperationPath::Sequential, "halt took the {:?} path", report.path);
    ensure!(lenient.sim.fabric_ops().is_empty(), "sequential fallback touched the trigger fabric");
    lenient.expect_all(RunState::Halted)?;
    lenient.expect_one_stop(lenient.first())?;
    Ok(format!("fail-fast refused, sequential halted without {}", unbound))
}

fn timeout(config: &Config) -> Result<String> {
    let mut config = config.clone();
    if let Some(cluster) = config.clusters.first_mut() {
        cluster.timeout_ms = cluster.timeout_ms.min(TIMEOUT_SCENARIO_CAP_MS);
    }
    let bench = Bench::new(&config)?;
    bench.examine_all()?;
    let stuck = bench.last().to_string();
    bench.sim.set_stuck(&stuck, true);

    let report = bench.controller.halt_core(bench.first())?;
    ensure!(report.outcome == OperationOutcome::TimedOut, "halt outcome {:?}", report.outcome);
    ensure!(report.timed_out() == [stuck.clone()], "timed out set {:?}", report.timed_out());
    for core in report.participants.iter().filter(|c| **c != stuck) {
        ensure!(
            bench.controller.status(core)?.run_state == RunState::Halted,
            "{} did not halt",
            core
        );
    }
    ensure!(
        matches!(report.clone().into_result(), Err(RunControlError::ConvergenceTimeout { .. })),
        "partial halt did not convert to a timeout error"
    );

    // Lock released: the cluster accepts the next operation
    bench.sim.set_stuck(&stuck, false);
    bench.controller.resume_cluster(&bench.cluster.name)?.into_result()?;
    bench.expect_all(RunState::Running)?;
    Ok(format!("{} named after {} ms", stuck, report.convergence.elapsed_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_parse() {
        assert_eq!("group-halt".parse::<Scenario>().unwrap(), Scenario::GroupHalt);
        assert_eq!("H".parse::<Scenario>().unwrap(), Scenario::Timeout);
        let err = "single-step".parse::<Scenario>().unwrap_err();
        assert!(err.contains("bring-up"));
    }

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in Scenario::all() {
            assert_eq!(scenario.to_string().parse::<Scenario>().unwrap(), scenario);
        }
    }

    #[test]
    fn test_all_scenarios_pass_on_default_config() {
        let config = Config::default();
        for scenario in Scenario::all() {
            let outcome = run(scenario, &config);
            assert!(outcome.passed, "{} failed: {}", scenario, outcome.detail);
        }
    }

    #[test]
    fn test_single_core_cluster_fails_cleanly() {
        let mut config = Config::default();
        config.clusters[0].members.truncate(1);
        let outcome = run(Scenario::GroupHalt, &config);
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("at least two cores"));
    }
}
