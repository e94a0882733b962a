#![forbid(unsafe_code)]

//! The drain engine.
//!
//! # Design
//!
//! Work is filed as *entries*: a target node, the rank the node had when the
//! entry was filed, and an action. Entries sit in an ordered set keyed by
//! `(rank, entry id)`, so the lowest rank drains first and equal ranks drain
//! in filing order.
//!
//! Ranks can grow while a transaction is open (a new edge raises everything
//! downstream of it). An entry whose target was raised after filing is
//! re-filed at the new rank before it may run: lazily when it reaches the
//! front of the queue, and eagerly for every entry after a
//! [`link`](TransactionImpl::link) that changed ranks.
//!
//! # Invariants
//!
//! 1. An entry runs only when its filed rank equals its target's current
//!    rank, and no other pending entry has a lower `(rank, id)`.
//! 2. Final actions run after the prioritized queue is empty, once each, in
//!    the order they were added. Prioritized work filed by a final action is
//!    drained before the next final action starts.
//! 3. After [`process_transactional`](TransactionImpl::process_transactional)
//!    both queues are empty.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::error::FlowResult;
use crate::node::{Firing, Holder, Node, Rank};
use crate::partition::Partition;
use crate::stats::TransactionReport;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Work run inside a transaction.
pub type Action = Box<dyn FnOnce(&mut TransactionImpl) + Send>;

/// Filing order of an entry, the tiebreaker between equal ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

struct Entry {
    target: Arc<Node>,
    rank: Rank,
    action: Action,
}

/// One atomic transaction's pending work.
pub struct TransactionImpl {
    id: u64,
    partition: Arc<Partition>,
    rank_limit: Rank,
    trace_entries: bool,
    next_entry_id: u64,
    entries: AHashMap<EntryId, Entry>,
    queue: BTreeSet<(Rank, EntryId)>,
    finals: VecDeque<Action>,
    needs_rebuild: bool,
    report: TransactionReport,
}

impl fmt::Debug for TransactionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionImpl")
            .field("id", &self.id)
            .field("partition", &self.partition.id())
            .field("pending", &self.entries.len())
            .field("pending_final", &self.finals.len())
            .finish()
    }
}

impl TransactionImpl {
    pub(crate) fn new(partition: Arc<Partition>) -> Self {
        let id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            rank_limit: partition.config().rank_limit,
            trace_entries: partition.config().trace_entries,
            partition,
            next_entry_id: 0,
            entries: AHashMap::new(),
            queue: BTreeSet::new(),
            finals: VecDeque::new(),
            needs_rebuild: false,
            report: TransactionReport {
                id,
                ..TransactionReport::default()
            },
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn partition_id(&self) -> u64 {
        self.partition.id()
    }

    #[must_use]
    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    #[must_use]
    pub fn rank_limit(&self) -> Rank {
        self.rank_limit
    }

    /// Prioritized entries not yet drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Final actions not yet run.
    #[must_use]
    pub fn pending_final(&self) -> usize {
        self.finals.len()
    }

    // ── Filing work ──────────────────────────────────────────────────

    /// File `action` to run when `target`'s rank is reached.
    pub fn prioritized(
        &mut self,
        target: &Arc<Node>,
        action: impl FnOnce(&mut TransactionImpl) + Send + 'static,
    ) -> EntryId {
        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;
        let rank = target.rank();
        self.entries.insert(
            id,
            Entry {
                target: Arc::clone(target),
                rank,
                action: Box::new(action),
            },
        );
        self.queue.insert((rank, id));
        id
    }

    /// Run `action` once all prioritized work is done.
    pub fn last(&mut self, action: impl FnOnce(&mut TransactionImpl) + Send + 'static) {
        self.finals.push_back(Box::new(action));
    }

    /// Add the edge `from → to` within this partition's rank limit.
    ///
    /// # Errors
    ///
    /// As [`Node::link_with_limit`].
    pub fn link(&mut self, from: &Node, holder: &Holder, to: &Arc<Node>) -> FlowResult<bool> {
        let changed = from.link_with_limit(holder, to, self.rank_limit)?;
        if changed {
            self.needs_rebuild = true;
        }
        Ok(changed)
    }

    /// Fire `firing` from `node` in this transaction.
    pub fn send(&mut self, node: &Arc<Node>, firing: Firing) {
        node.send(self, firing);
    }

    /// Defer `action` until this transaction has fully closed.
    pub fn post(&self, action: impl FnOnce() + Send + 'static) {
        self.partition.post(action);
    }

    // ── Draining ─────────────────────────────────────────────────────

    /// Drain every prioritized entry in rank order, then run the final
    /// actions.
    pub fn process_transactional(&mut self) -> TransactionReport {
        loop {
            self.drain_prioritized();
            let Some(action) = self.finals.pop_front() else {
                break;
            };
            action(self);
            self.report.final_actions += 1;
        }
        debug_assert!(self.entries.is_empty() && self.queue.is_empty());
        self.report
    }

    fn drain_prioritized(&mut self) {
        while let Some((rank, id, entry)) = self.pop_ready() {
            if self.trace_entries {
                tracing::trace!(
                    txn = self.id,
                    entry = id.0,
                    rank,
                    node = %entry.target.id(),
                    "drain entry"
                );
            }
            let Entry { target, action, .. } = entry;
            action(self);
            drop(target);
            self.report.entries_drained += 1;
            self.report.max_rank = Some(self.report.max_rank.map_or(rank, |max| max.max(rank)));
        }
    }

    /// Take the lowest entry whose filed rank is still current.
    fn pop_ready(&mut self) -> Option<(Rank, EntryId, Entry)> {
        loop {
            if self.needs_rebuild {
                self.rebuild();
            }
            let (rank, id) = self.queue.pop_first()?;
            let Some(mut entry) = self.entries.remove(&id) else {
                continue;
            };
            let now = entry.target.rank();
            if now == rank {
                return Some((rank, id, entry));
            }
            tracing::trace!(txn = self.id, entry = id.0, from = rank, to = now, "entry re-filed");
            entry.rank = now;
            self.entries.insert(id, entry);
            self.queue.insert((now, id));
            self.report.entries_refiled += 1;
        }
    }

    /// Re-file every entry whose target's rank changed since filing.
    fn rebuild(&mut self) {
        self.needs_rebuild = false;
        for (id, entry) in &mut self.entries {
            let now = entry.target.rank();
            if now != entry.rank {
                self.queue.remove(&(entry.rank, *id));
                self.queue.insert((now, *id));
                entry.rank = now;
                self.report.entries_refiled += 1;
            }
        }
    }
}
