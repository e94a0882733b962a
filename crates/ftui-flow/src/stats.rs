#![forbid(unsafe_code)]

//! Partition counters and per-transaction drain reports.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::Rank;

/// What one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionReport {
    /// Transaction id.
    pub id: u64,
    /// Prioritized entries whose action ran.
    pub entries_drained: u64,
    /// Entries re-filed because their target's rank changed after filing.
    pub entries_refiled: u64,
    /// Final actions run.
    pub final_actions: u64,
    /// Highest rank drained, if any entry ran.
    pub max_rank: Option<Rank>,
}

/// Snapshot of a partition's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub transactions_opened: u64,
    pub transactions_completed: u64,
    pub transactions_abandoned: u64,
    /// Opens that joined an already open transaction on the same thread.
    pub nested_joins: u64,
    pub entries_drained: u64,
    pub entries_refiled: u64,
    pub final_actions: u64,
    pub deferred_run: u64,
}

impl PartitionStats {
    /// Transactions opened but not yet completed or abandoned.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.transactions_opened
            .saturating_sub(self.transactions_completed + self.transactions_abandoned)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    opened: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    nested: AtomicU64,
    drained: AtomicU64,
    refiled: AtomicU64,
    finals: AtomicU64,
    deferred: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn nested(&self) {
        self.nested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self, report: &TransactionReport) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.drained
            .fetch_add(report.entries_drained, Ordering::Relaxed);
        self.refiled
            .fetch_add(report.entries_refiled, Ordering::Relaxed);
        self.finals.fetch_add(report.final_actions, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PartitionStats {
        PartitionStats {
            transactions_opened: self.opened.load(Ordering::Relaxed),
            transactions_completed: self.completed.load(Ordering::Relaxed),
            transactions_abandoned: self.abandoned.load(Ordering::Relaxed),
            nested_joins: self.nested.load(Ordering::Relaxed),
            entries_drained: self.drained.load(Ordering::Relaxed),
            entries_refiled: self.refiled.load(Ordering::Relaxed),
            final_actions: self.finals.load(Ordering::Relaxed),
            deferred_run: self.deferred.load(Ordering::Relaxed),
        }
    }
}
