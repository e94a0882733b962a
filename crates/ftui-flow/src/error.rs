#![forbid(unsafe_code)]

//! Error types for the propagation core.
//!
//! Only conditions a caller can meaningfully surface are returned as
//! [`FlowError`]. Contract violations that mean the ordering or memory
//! invariants are already broken (a listener slot released more times than it
//! was retained, a freed listener still holding cleanups) are fatal and panic
//! with a message naming the invariant.

use thiserror::Error;

use crate::node::{NodeId, Rank};

pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Raising `node` above `rank` would reach the rank sentinel.
    #[error("rank invariant: node {node} needs a rank above {rank}, limit is {limit}")]
    RankOverflow { node: NodeId, rank: Rank, limit: Rank },

    /// Linking `from` → `to` would close a cycle that no ranking satisfies.
    #[error("rank invariant: linking node {from} -> node {to} closes a cycle")]
    RankCycle { from: NodeId, to: NodeId },

    /// A transaction was opened on a partition whose transaction is
    /// currently draining on the same thread.
    #[error("reentrancy invariant: partition {partition} is draining on this thread")]
    ReentrantDrain { partition: u64 },

    /// The worker thread behind a dispatch policy is no longer running.
    #[error("dispatch policy worker has shut down")]
    PolicyWorkerGone,
}

impl FlowError {
    /// Whether this error reports a broken rank invariant.
    #[must_use]
    pub fn is_rank_error(&self) -> bool {
        matches!(self, Self::RankOverflow { .. } | Self::RankCycle { .. })
    }
}
