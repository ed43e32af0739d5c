//! Per-pair replication states and the outcomes reported to callers.

use std::fmt;

use serde::{Deserialize, Serialize};

use cdn_types::{ItemId, UnitId};

/// Where one (item, target) replication stands.
///
/// `Pending → Leased → Transferring → Verifying → Bound`, with any step able
/// to fall to `Failed`. `Failed` returns to `Pending` on retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Leased,
    Transferring,
    Verifying,
    Bound,
    Failed,
}

impl SyncState {
    pub fn can_advance_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Pending, Leased)
                | (Leased, Transferring)
                | (Leased, Bound)
                | (Transferring, Verifying)
                | (Verifying, Bound)
                | (Leased | Transferring | Verifying, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Bound | Self::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Bound => "bound",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks one pair through its states, logging each transition.
#[derive(Debug)]
pub(crate) struct PairProgress {
    item: ItemId,
    unit: UnitId,
    state: SyncState,
}

impl PairProgress {
    pub(crate) fn new(item: ItemId, unit: &UnitId) -> Self {
        Self {
            item,
            unit: unit.clone(),
            state: SyncState::Pending,
        }
    }

    pub(crate) fn advance(&mut self, next: SyncState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        tracing::debug!(item = %self.item, unit = %self.unit, from = %self.state, to = %next, "sync state");
        self.state = next;
    }

    pub(crate) fn state(&self) -> SyncState {
        self.state
    }
}

/// Result of one replication attempt that did not fail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SyncOutcome {
    /// Copied, verified, and bound.
    Bound { stored_bytes: u64 },
    /// Another worker bound the pair first.
    AlreadyBound,
    /// Another worker holds the lease; skipped.
    LeaseHeld,
    /// The item is not finalized yet.
    NotReady,
    /// Stopped by cancellation. Not a failure.
    Cancelled,
}

/// Totals for one replication cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub bound: usize,
    pub already_bound: usize,
    pub lease_held: usize,
    pub not_ready: usize,
    pub cancelled: usize,
    pub failed: usize,
    /// Skipped because their retry backoff has not elapsed.
    pub deferred: usize,
    /// Skipped because they need operator attention.
    pub needs_attention: usize,
}

impl CycleReport {
    pub(crate) fn record(&mut self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Bound { .. } => self.bound += 1,
            SyncOutcome::AlreadyBound => self.already_bound += 1,
            SyncOutcome::LeaseHeld => self.lease_held += 1,
            SyncOutcome::NotReady => self.not_ready += 1,
            SyncOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Pairs this cycle looked at, including skipped ones.
    pub fn total(&self) -> usize {
        self.bound
            + self.already_bound
            + self.lease_held
            + self.not_ready
            + self.cancelled
            + self.failed
            + self.deferred
            + self.needs_attention
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use SyncState::*;
        let path = [Pending, Leased, Transferring, Verifying, Bound];
        for w in path.windows(2) {
            assert!(w[0].can_advance_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn bound_is_terminal() {
        use SyncState::*;
        for next in [Pending, Leased, Transferring, Verifying, Failed] {
            assert!(!Bound.can_advance_to(next));
        }
        assert!(Bound.is_final());
    }

    #[test]
    fn cannot_skip_verification() {
        assert!(!SyncState::Transferring.can_advance_to(SyncState::Bound));
        assert!(!SyncState::Pending.can_advance_to(SyncState::Transferring));
    }

    #[test]
    fn progress_tracks_state() {
        let mut p = PairProgress::new(ItemId::new(), &UnitId::new("nfs").unwrap());
        p.advance(SyncState::Leased);
        p.advance(SyncState::Failed);
        assert_eq!(p.state(), SyncState::Failed);
    }

    #[test]
    fn report_counts_outcomes() {
        let mut r = CycleReport::default();
        r.record(&SyncOutcome::Bound { stored_bytes: 3 });
        r.record(&SyncOutcome::LeaseHeld);
        r.failed += 1;
        assert_eq!(r.bound, 1);
        assert_eq!(r.total(), 3);
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_string(&SyncOutcome::Bound { stored_bytes: 7 }).unwrap();
        assert_eq!(json, r#"{"outcome":"bound","stored_bytes":7}"#);
    }
}
