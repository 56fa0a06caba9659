//! Trace emission.
//!
//! Short traces go out as a single emission; long traces are split into
//! continuation rounds tied to the same trace id, emitted one round per
//! long-write tick so the backend has to assemble them. The round layout is
//! derived from the seed, so the validation path reconstructs the same final
//! trace without knowing how many rounds have landed.

use std::sync::Arc;

use tracing::info;

use crate::client::{IngestError, SpanIngester};
use crate::seed::Seed;
use crate::synthetic::{self, SpanBatch, SyntheticTrace};

/// Remaining emission state for one trace. Rounds are strictly sequential:
/// the plan is owned by a single continuation task, and a failed round aborts
/// everything after it.
#[derive(Debug)]
pub struct EmissionPlan {
    seed: Seed,
    rounds: Vec<Vec<SpanBatch>>,
    next_round: usize,
}

impl EmissionPlan {
    fn build(seed: &Seed) -> EmissionPlan {
        let trace = synthetic::construct_trace(seed);
        let round_count = synthetic::long_writes_for(seed) as usize + 1;
        let per_round = trace.batches.len() / round_count;

        let mut rounds = Vec::with_capacity(round_count);
        let mut rest = trace.batches;
        for _ in 0..round_count {
            let tail = rest.split_off(per_round);
            rounds.push(rest);
            rest = tail;
        }

        EmissionPlan {
            seed: seed.clone(),
            rounds,
            next_round: 0,
        }
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    /// Rounds not yet emitted (or aborted).
    pub fn rounds_remaining(&self) -> usize {
        self.rounds.len() - self.next_round
    }
}

/// Emits span batches for a seed through an injected [`SpanIngester`].
#[derive(Clone)]
pub struct TraceEmitter {
    ingester: Arc<dyn SpanIngester>,
    tenant: String,
}

impl TraceEmitter {
    pub fn new(ingester: Arc<dyn SpanIngester>, tenant: impl Into<String>) -> Self {
        TraceEmitter {
            ingester,
            tenant: tenant.into(),
        }
    }

    /// Emit the first round for `seed` and return the continuation plan. For
    /// short traces the plan comes back with zero rounds remaining.
    pub async fn emit_first(&self, seed: &Seed) -> Result<EmissionPlan, IngestError> {
        let mut plan = EmissionPlan::build(seed);
        self.emit_round(&mut plan).await?;
        Ok(plan)
    }

    /// Emit the next continuation round. A failure aborts the remaining
    /// schedule for this trace; rounds already emitted stand.
    pub async fn emit_next(&self, plan: &mut EmissionPlan) -> Result<usize, IngestError> {
        if plan.rounds_remaining() == 0 {
            return Ok(0);
        }
        if let Err(err) = self.emit_round(plan).await {
            plan.next_round = plan.rounds.len();
            return Err(err);
        }
        Ok(plan.rounds_remaining())
    }

    /// Emit every round for `seed` immediately and return the full expected
    /// trace. Used by one-shot validation, where retrieval is checked in the
    /// same cycle as the write.
    pub async fn emit_all(&self, seed: &Seed) -> Result<SyntheticTrace, IngestError> {
        let mut plan = EmissionPlan::build(seed);
        while plan.rounds_remaining() > 0 {
            self.emit_round(&mut plan).await?;
        }
        Ok(synthetic::construct_trace(seed))
    }

    async fn emit_round(&self, plan: &mut EmissionPlan) -> Result<(), IngestError> {
        let round = plan.next_round;
        info!(
            seed = plan.seed.unix_seconds(),
            trace_id = %plan.seed.trace_id(),
            tenant = %self.tenant,
            round,
            "sending trace"
        );
        for batch in &plan.rounds[round] {
            self.ingester.emit_batch(&self.tenant, batch).await?;
        }
        plan.next_round += 1;
        Ok(())
    }
}
