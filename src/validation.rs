//! One-shot validation mode.
//!
//! Instead of probing forever, run a fixed number of write/read cycles, give
//! the backend time to index, search-validate every written trace, and report
//! through the process exit code. A write failure is fatal and ends the run
//! on the spot, search phase included: validating traces that were never
//! written proves nothing. Retrieval and search failures accumulate so one
//! run surfaces the full set of problems.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{error, info};

use crate::checks;
use crate::client::{SpanIngester, TraceQuerier, TraceSearcher};
use crate::config::VultureConfig;
use crate::emitter::TraceEmitter;
use crate::seed::Seed;

/// Time source, injectable so tests can run cycles without real waiting.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio's timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Which stage of a validation run a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Write,
    Read,
    Search,
    Timeout,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Write => "write",
            Phase::Read => "read",
            Phase::Search => "search",
            Phase::Timeout => "timeout",
        }
    }
}

/// One recorded failure of a validation run.
#[derive(Clone, Debug)]
pub struct ValidationFailure {
    pub trace_id: String,
    pub cycle: usize,
    pub phase: Phase,
    pub error: String,
    pub timestamp: SystemTime,
}

/// Outcome of a whole validation run.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub total_traces: usize,
    pub success_count: usize,
    pub failures: Vec<ValidationFailure>,
    pub duration: Duration,
}

impl ValidationResult {
    /// 0 iff the run recorded no failures, regardless of count.
    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Knobs for a validation run, carved out of the full config.
#[derive(Clone, Debug)]
pub struct ValidationConfig {
    pub cycles: usize,
    pub timeout: Duration,
    pub tenant: String,
    pub search_backoff: Duration,
    pub search_settle: Duration,
}

impl ValidationConfig {
    pub fn from_config(config: &VultureConfig) -> Self {
        ValidationConfig {
            cycles: config.validation_cycles,
            timeout: config.validation_timeout,
            tenant: config.tenant.clone(),
            search_backoff: config.search_backoff,
            search_settle: config.search_settle,
        }
    }
}

/// Drives a bounded validation run against injected clients.
pub struct ValidationService<C: Clock> {
    config: ValidationConfig,
    clock: C,
}

impl<C: Clock> ValidationService<C> {
    pub fn new(config: ValidationConfig, clock: C) -> Self {
        ValidationService { config, clock }
    }

    pub async fn run(
        &self,
        ingester: Arc<dyn SpanIngester>,
        querier: &dyn TraceQuerier,
        searcher: &dyn TraceSearcher,
    ) -> ValidationResult {
        let start = self.clock.now();
        let deadline = (!self.config.timeout.is_zero()).then(|| start + self.config.timeout);
        let emitter = TraceEmitter::new(ingester, self.config.tenant.clone());

        let mut result = ValidationResult {
            total_traces: self.config.cycles,
            ..ValidationResult::default()
        };
        let mut written: Vec<Seed> = Vec::with_capacity(self.config.cycles);

        for cycle in 0..self.config.cycles {
            if self.past_deadline(deadline) {
                result.failures.push(self.failure(
                    String::new(),
                    cycle,
                    Phase::Timeout,
                    "deadline reached before completing all cycles",
                ));
                break;
            }

            // bucket to a second so consecutive cycles get distinct seeds
            let seed = match Seed::new(
                self.clock.now(),
                Duration::from_secs(1),
                self.config.tenant.clone(),
            ) {
                Ok(seed) => seed,
                Err(err) => {
                    result.failures.push(self.failure(
                        String::new(),
                        cycle,
                        Phase::Write,
                        &err.to_string(),
                    ));
                    return self.finalize(start, result);
                }
            };

            if let Err(err) = emitter.emit_all(&seed).await {
                error!(cycle, %err, "write failed, aborting run");
                result.failures.push(self.failure(
                    seed.hex_id(),
                    cycle,
                    Phase::Write,
                    &err.to_string(),
                ));
                return self.finalize(start, result);
            }
            info!(cycle, trace_id = %seed.trace_id(), "wrote trace");
            written.push(seed.clone());

            let report = checks::validate_retrieval(&seed, querier).await;
            for category in report.failures() {
                result.failures.push(self.failure(
                    seed.hex_id(),
                    cycle,
                    Phase::Read,
                    category.as_str(),
                ));
            }

            self.clock.sleep(Duration::from_secs(1)).await;
        }

        if !self.config.search_backoff.is_zero() && !written.is_empty() {
            // give the backend time to index before searching
            self.clock.sleep(self.config.search_settle).await;

            for (cycle, seed) in written.iter().enumerate() {
                if self.past_deadline(deadline) {
                    result.failures.push(self.failure(
                        seed.hex_id(),
                        cycle,
                        Phase::Timeout,
                        "deadline reached before completing search phase",
                    ));
                    break;
                }
                let report = checks::validate_search(seed, searcher).await;
                for category in report.failures() {
                    result.failures.push(self.failure(
                        seed.hex_id(),
                        cycle,
                        Phase::Search,
                        category.as_str(),
                    ));
                }
            }
        }

        self.finalize(start, result)
    }

    fn finalize(&self, start: SystemTime, mut result: ValidationResult) -> ValidationResult {
        result.duration = self
            .clock
            .now()
            .duration_since(start)
            .unwrap_or(Duration::ZERO);
        // a trace that fails several checks is still one failed trace
        let failed_traces: HashSet<&str> = result
            .failures
            .iter()
            .map(|f| f.trace_id.as_str())
            .collect();
        result.success_count = result.total_traces.saturating_sub(failed_traces.len());
        result
    }

    fn past_deadline(&self, deadline: Option<SystemTime>) -> bool {
        deadline.is_some_and(|d| self.clock.now() >= d)
    }

    fn failure(
        &self,
        trace_id: String,
        cycle: usize,
        phase: Phase,
        error: &str,
    ) -> ValidationFailure {
        ValidationFailure {
            trace_id,
            cycle,
            phase,
            error: error.to_owned(),
            timestamp: self.clock.now(),
        }
    }
}
