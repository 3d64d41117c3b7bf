//! The submit-or-stop decision against the queue ceiling.

use crate::queue::QueueSnapshot;

/// The outcome of comparing queue load against the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityDecision {
    /// The configured ceiling on queue entries.
    pub ceiling: u64,
    /// The number of entries already occupied.
    pub occupied: u64,
    /// The number of rows that would be submitted.
    pub requested: usize,
    /// The capacity left under the ceiling; negative when over it.
    pub remaining: i64,
}

impl CapacityDecision {
    /// Determines if the whole matrix may be submitted.
    ///
    /// Admission is all-or-nothing: rows are never truncated to fit.
    pub fn admits(&self) -> bool {
        self.remaining > 0
    }
}

/// Decides whether a matrix of `requested` rows may be submitted.
pub fn decide(ceiling: u64, snapshot: &QueueSnapshot, requested: usize) -> CapacityDecision {
    let remaining = i128::from(ceiling) - i128::from(snapshot.occupied);
    CapacityDecision {
        ceiling,
        occupied: snapshot.occupied,
        requested,
        remaining: remaining.clamp(i64::MIN.into(), i64::MAX.into()) as i64,
    }
}
