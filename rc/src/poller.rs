//! Bounded-time convergence polling
//!
//! After a trigger pulse each participant changes state on its own. The
//! poller samples every core that has not yet reached the target state once
//! per round until all have, the timeout elapses, or the operation is
//! cancelled. Polling blocks the calling thread; the only waits are the
//! transport round trips and the interval between rounds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{CoreId, RunState};
use crate::error::TransportError;
use crate::registry::CoreRegistry;
use crate::transport::CoreAccess;

/// Polling cadence and per-sample retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Wait between polling rounds in milliseconds
    #[serde(rename = "interval-ms", default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Extra attempts for a sample that fails transiently
    #[serde(rename = "sample-retries", default = "default_sample_retries")]
    pub sample_retries: u32,

    /// Wait before each retry of a failed sample in milliseconds
    #[serde(rename = "retry-backoff-ms", default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_interval_ms() -> u64 {
    10
}

fn default_sample_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            sample_retries: default_sample_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Outcome of polling one core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreOutcome {
    pub core: CoreId,
    #[serde(rename = "reached-target")]
    pub reached_target: bool,
    /// Last observed state (the registry's state if never sampled)
    #[serde(rename = "final-state")]
    pub final_state: RunState,
}

/// Result of one convergence wait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceResult {
    pub target: RunState,
    /// Per-core outcomes in participant order
    pub outcomes: Vec<CoreOutcome>,
    /// Cores that did not reach the target, in participant order
    #[serde(rename = "timed-out")]
    pub timed_out: Vec<CoreId>,
    #[serde(rename = "elapsed-ms")]
    pub elapsed_ms: u64,
    /// Polling stopped because the operation was cancelled
    pub cancelled: bool,
}

impl ConvergenceResult {
    /// Every participant reached the target
    pub fn overall_success(&self) -> bool {
        self.timed_out.is_empty() && !self.cancelled
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Cores that reached the target, in participant order
    pub fn converged(&self) -> impl Iterator<Item = &CoreId> {
        self.outcomes.iter().filter(|o| o.reached_target).map(|o| &o.core)
    }

    pub fn outcome(&self, core: &str) -> Option<&CoreOutcome> {
        self.outcomes.iter().find(|o| o.core == core)
    }

    /// Result for a set of cores that were already at the target
    pub fn immediate(target: RunState, cores: &[CoreId]) -> Self {
        Self {
            target,
            outcomes: cores
                .iter()
                .map(|c| CoreOutcome {
                    core: c.clone(),
                    reached_target: true,
                    final_state: target,
                })
                .collect(),
            timed_out: Vec::new(),
            elapsed_ms: 0,
            cancelled: false,
        }
    }
}

/// Samples a set of cores until they reach a target state
pub struct ConvergencePoller {
    access: Arc<dyn CoreAccess>,
    config: PollConfig,
}

impl ConvergencePoller {
    pub fn new(access: Arc<dyn CoreAccess>, config: PollConfig) -> Self {
        debug!(?config, "ConvergencePoller::new: called");
        Self { access, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Sample one core, retrying transient failures with backoff
    fn sample(&self, core: &str) -> Result<RunState, TransportError> {
        let mut attempt = 0;
        loop {
            match self.access.read_state(core) {
                Ok(state) => return Ok(state),
                Err(e) if e.is_transient() && attempt < self.config.sample_retries => {
                    attempt += 1;
                    debug!(%core, attempt, error = %e, "ConvergencePoller::sample: transient failure, retrying");
                    thread::sleep(self.config.retry_backoff());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll `cores` until all are in `target`, `timeout` elapses, or `cancel` is set
    ///
    /// Every pending core is sampled at least once, even with a zero timeout.
    /// A sample that still fails after its retries counts as not converged
    /// for that round; the remaining cores keep being polled.
    pub fn wait_for(
        &self,
        registry: &CoreRegistry,
        cores: &[CoreId],
        target: RunState,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> ConvergenceResult {
        debug!(participants = ?cores, %target, ?timeout, "ConvergencePoller::wait_for: called");
        let start = Instant::now();

        let mut outcomes: Vec<CoreOutcome> = cores
            .iter()
            .map(|c| CoreOutcome {
                core: c.clone(),
                reached_target: false,
                final_state: registry.state(c).unwrap_or_default(),
            })
            .collect();
        let mut cancelled = false;
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            for outcome in outcomes.iter_mut().filter(|o| !o.reached_target) {
                match self.sample(&outcome.core) {
                    Ok(state) => {
                        outcome.final_state = state;
                        outcome.reached_target = state == target;
                    }
                    Err(e) => {
                        warn!(core = %outcome.core, error = %e, "Run-state sample failed");
                    }
                }
            }

            if outcomes.iter().all(|o| o.reached_target) {
                debug!(rounds, "ConvergencePoller::wait_for: all cores converged");
                break;
            }
            if cancel.load(Ordering::SeqCst) {
                debug!(rounds, "ConvergencePoller::wait_for: cancelled");
                cancelled = true;
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                debug!(rounds, "ConvergencePoller::wait_for: timeout elapsed");
                break;
            }
            thread::sleep(self.config.interval().min(timeout - elapsed));
        }

        let timed_out: Vec<CoreId> = outcomes
            .iter()
            .filter(|o| !o.reached_target)
            .map(|o| o.core.clone())
            .collect();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if timed_out.is_empty() {
            info!(participants = ?cores, %target, elapsed_ms, "Convergence reached");
        } else {
            warn!(participants = ?cores, %target, timed_out = ?timed_out, elapsed_ms, cancelled, "Convergence not reached");
        }

        ConvergenceResult {
            target,
            outcomes,
            timed_out,
            elapsed_ms,
            cancelled,
        }
    }
}
