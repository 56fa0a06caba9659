//! The probe loops.
//!
//! Write, read, search, and tracked each tick on their own interval and
//! share nothing but the metrics sink. The read and search loops pick a past
//! seed at random, clamped to the retention window, and skip any seed whose
//! writes could still be in flight (the readiness guard). The tracked loop
//! emits batches with known span counts and validates them once enough
//! history exists. Long-trace continuation runs as its own cancellable task
//! per trace, so a slow backend never backs up the write cadence.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info};

use crate::checks;
use crate::client::{SpanIngester, TraceQuerier, TraceSearcher};
use crate::config::VultureConfig;
use crate::emitter::{EmissionPlan, TraceEmitter};
use crate::metrics::{ErrorCategory, ProbeMetrics};
use crate::seed::Seed;
use crate::synthetic;
use crate::tracker::{self, SpanTracker};

/// Soak-mode probe: owns the clients and runs until shutdown is signalled.
pub struct Vulture {
    config: VultureConfig,
    emitter: TraceEmitter,
    ingester: Arc<dyn SpanIngester>,
    querier: Arc<dyn TraceQuerier>,
    searcher: Arc<dyn TraceSearcher>,
    metrics: Arc<ProbeMetrics>,
}

impl Vulture {
    pub fn new(
        config: VultureConfig,
        ingester: Arc<dyn SpanIngester>,
        querier: Arc<dyn TraceQuerier>,
        searcher: Arc<dyn TraceSearcher>,
    ) -> Self {
        let emitter = TraceEmitter::new(Arc::clone(&ingester), config.tenant.clone());
        Vulture {
            config,
            emitter,
            ingester,
            querier,
            searcher,
            metrics: Arc::new(ProbeMetrics::new()),
        }
    }

    /// Shared handle to the outcome counters.
    pub fn metrics(&self) -> Arc<ProbeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run all enabled loops until `shutdown` flips. In-flight ticks finish;
    /// no new ticks are scheduled afterwards.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        let mut handles = vec![tokio::spawn(Arc::clone(&this).write_loop(shutdown.clone()))];
        if !this.config.read_backoff.is_zero() {
            handles.push(tokio::spawn(Arc::clone(&this).read_loop(shutdown.clone())));
        }
        if !this.config.search_backoff.is_zero() {
            handles.push(tokio::spawn(Arc::clone(&this).search_loop(shutdown.clone())));
        }
        if !this.config.tracker_backoff.is_zero() {
            handles.push(tokio::spawn(Arc::clone(&this).tracked_loop(shutdown)));
        }
        join_all(handles).await;
    }

    async fn write_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.write_backoff);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let seed = match Seed::new(
                SystemTime::now(),
                self.config.write_backoff,
                self.config.tenant.clone(),
            ) {
                Ok(seed) => seed,
                Err(err) => {
                    error!(%err, "cannot build write seed");
                    continue;
                }
            };

            match self.emitter.emit_first(&seed).await {
                Ok(plan) if plan.rounds_remaining() > 0 => {
                    tokio::spawn(
                        Arc::clone(&self).continue_long_writes(plan, shutdown.clone()),
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    error!(seed = seed.unix_seconds(), %err, "failed to emit trace");
                    self.metrics.record_failure(ErrorCategory::WriteFailed);
                }
            }
        }
    }

    /// Emit the remaining rounds of one long trace, one round per long-write
    /// backoff. Rounds stay strictly sequential because this task owns the
    /// plan; shutdown cancels whatever has not been emitted yet.
    async fn continue_long_writes(
        self: Arc<Self>,
        mut plan: EmissionPlan,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while plan.rounds_remaining() > 0 {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(self.config.long_write_backoff) => {}
            }
            info!(
                seed = plan.seed().unix_seconds(),
                trace_id = %plan.seed().trace_id(),
                rounds_remaining = plan.rounds_remaining(),
                "queueing future batches"
            );
            if let Err(err) = self.emitter.emit_next(&mut plan).await {
                error!(seed = plan.seed().unix_seconds(), %err, "failed to emit continuation round");
                self.metrics.record_failure(ErrorCategory::WriteFailed);
                return;
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start_unix = unix_now();
        let mut lower_bound = start_unix;
        let mut rng = StdRng::seed_from_u64(start_unix);
        let mut ticker = interval(self.config.read_backoff);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let now_unix = unix_now();
            let (new_lower, ts) = select_past_timestamp(
                lower_bound,
                now_unix,
                self.config.write_backoff,
                self.config.retention,
                &mut rng,
            );
            lower_bound = new_lower;

            let seed = Seed::at(ts, self.config.tenant.clone());
            if !trace_is_ready(
                &seed,
                now_unix,
                start_unix,
                self.config.write_backoff,
                self.config.long_write_backoff,
            ) {
                continue;
            }

            let report = checks::validate_retrieval(&seed, self.querier.as_ref()).await;
            self.metrics.record(&report);
        }
    }

    async fn search_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start_unix = unix_now();
        let mut rng = StdRng::seed_from_u64(start_unix.wrapping_add(1));
        let mut ticker = interval(self.config.search_backoff);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let now_unix = unix_now();
            let (_, ts) = select_past_timestamp(
                start_unix,
                now_unix,
                self.config.write_backoff,
                self.config.retention,
                &mut rng,
            );

            let seed = Seed::at(ts, self.config.tenant.clone());
            if !trace_is_ready(
                &seed,
                now_unix,
                start_unix,
                self.config.write_backoff,
                self.config.long_write_backoff,
            ) {
                continue;
            }

            let report = checks::validate_search(&seed, self.searcher.as_ref()).await;
            self.metrics.record(&report);
        }
    }

    /// Emit one tracked batch per tick, then check the recorded counts
    /// against the search endpoint once enough history has built up.
    async fn tracked_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tracker = SpanTracker::new(SystemTime::now());
        let mut ticker = interval(self.config.tracker_backoff);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let batch = tracker.next_batch(SystemTime::now());
            if let Err(err) = self.ingester.emit_batch(&self.config.tenant, &batch).await {
                error!(%err, "failed to emit tracked batch");
                self.metrics.record_failure(ErrorCategory::WriteFailed);
                tracker.void_last();
                continue;
            }

            if let Some(window) = tracker.sample_window() {
                let report =
                    tracker::validate_tracked(&self.config.tenant, &window, self.searcher.as_ref())
                        .await;
                self.metrics.record(&report);
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Whether a seed's writes can plausibly have completed.
///
/// Seeds inside the first two write intervals after process start are never
/// ready: the write loop may not have fired for them at all. After that, a
/// seed is ready once its initial write plus every continuation round has had
/// time to land.
pub fn trace_is_ready(
    seed: &Seed,
    now_unix: u64,
    start_unix: u64,
    write_backoff: Duration,
    long_write_backoff: Duration,
) -> bool {
    if seed.unix_seconds() < start_unix + 2 * write_backoff.as_secs() {
        return false;
    }
    let last_write_done = seed.unix_seconds()
        + write_backoff.as_secs()
        + synthetic::long_writes_for(seed) * long_write_backoff.as_secs();
    now_unix >= last_write_done
}

/// Pick a past, write-interval-aligned timestamp in
/// `[max(now - retention, lower_bound), now]`, returning the (possibly
/// advanced) lower bound and the picked bucket.
pub fn select_past_timestamp(
    lower_bound: u64,
    now_unix: u64,
    write_interval: Duration,
    retention: Duration,
    rng: &mut StdRng,
) -> (u64, u64) {
    let oldest = now_unix.saturating_sub(retention.as_secs());
    let lower = oldest.max(lower_bound);

    let step = write_interval.as_secs().max(1);
    let first_bucket = lower.div_ceil(step);
    let last_bucket = (now_unix / step).max(first_bucket);
    let bucket = if first_bucket == last_bucket {
        first_bucket
    } else {
        rng.random_range(first_bucket..=last_bucket)
    };

    (lower, bucket * step)
}
