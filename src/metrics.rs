//! Evaluation metrics collection for profiling fixpoint runs.
//!
//! Aggregate counters for the transaction loop and the join engine.
//! Compiled only under the `tracing` feature; without it the context
//! simply has no metrics field and call sites are compiled out.

#[cfg(feature = "tracing")]
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate metrics collected during evaluation.
///
/// All counters use relaxed ordering; the report after a transaction
/// completes is accurate.
#[cfg(feature = "tracing")]
#[derive(Debug)]
pub struct EvalMetrics {
    /// Changes processed through the block pipeline
    pub changes: AtomicU64,
    /// Rounds opened by the transaction loop
    pub rounds: AtomicU64,
    /// Commit frames opened
    pub frames: AtomicU64,
    /// Proposals resolved by the join engine
    pub proposals: AtomicU64,
    /// Candidate rows enumerated from resolved proposals
    pub candidates: AtomicU64,
    /// Candidate rows rejected by an accept check
    pub rejects: AtomicU64,
    /// Set-semantic deltas emitted by the distinct index
    pub distinct_emits: AtomicU64,
    /// Collapsed changes handed to the export path
    pub exports: AtomicU64,
}

#[cfg(feature = "tracing")]
impl EvalMetrics {
    /// A collector with all counters at zero.
    pub fn new() -> Self {
        Self {
            changes: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            proposals: AtomicU64::new(0),
            candidates: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            distinct_emits: AtomicU64::new(0),
            exports: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_change(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_proposal(&self) {
        self.proposals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_candidate(&self) {
        self.candidates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_distinct_emit(&self) {
        self.distinct_emits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_export(&self) {
        self.exports.fetch_add(1, Ordering::Relaxed);
    }

    /// A plain snapshot of every counter.
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            changes: self.changes.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            proposals: self.proposals.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            distinct_emits: self.distinct_emits.load(Ordering::Relaxed),
            exports: self.exports.load(Ordering::Relaxed),
        }
    }
}

#[cfg(feature = "tracing")]
impl Default for EvalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the evaluation counters.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsReport {
    pub changes: u64,
    pub rounds: u64,
    pub frames: u64,
    pub proposals: u64,
    pub candidates: u64,
    pub rejects: u64,
    pub distinct_emits: u64,
    pub exports: u64,
}

#[cfg(all(test, feature = "tracing"))]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = EvalMetrics::new();
        metrics.record_change();
        metrics.record_change();
        metrics.record_round();
        metrics.record_proposal();
        metrics.record_candidate();
        metrics.record_candidate();
        metrics.record_export();
        let report = metrics.report();
        assert_eq!(report.changes, 2);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.proposals, 1);
        assert_eq!(report.candidates, 2);
        assert_eq!(report.rejects, 0);
        assert_eq!(report.exports, 1);
    }
}
