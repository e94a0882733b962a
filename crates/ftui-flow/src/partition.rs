#![forbid(unsafe_code)]

//! Partitions: mutually exclusive execution contexts.
//!
//! # Design
//!
//! A [`Partition`] serializes every transaction opened on it. Its state lock
//! guards a *current-transaction slot* (owner thread, reentrancy depth,
//! phase, shared [`TransactionImpl`]) and a FIFO of deferred callbacks.
//! Threads that want to open a transaction while another thread owns the
//! slot wait on a [`Condvar`] until it is released.
//!
//! # Invariants
//!
//! 1. At most one transaction is registered per partition.
//! 2. The state lock is never held while user code runs and is never
//!    acquired recursively. Nested opens on the owning thread are counted by
//!    the slot's depth instead.
//! 3. Deferred callbacks run only while no transaction is draining, and a
//!    callback posted while callbacks are draining runs before that drain
//!    returns.
//! 4. The `processing_post` flag is reset even if a callback panics.
//!
//! # Failure Modes
//!
//! - **Opening from inside a drain** on the draining thread would wait on
//!   itself; it is rejected with [`FlowError::ReentrantDrain`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};

use crate::config::FlowConfig;
use crate::error::{FlowError, FlowResult};
use crate::listener::ListenerArena;
use crate::lock;
use crate::policy::{self, Job, Policy};
use crate::stats::{PartitionStats, StatsCounters, TransactionReport};
use crate::transaction::TransactionImpl;

static NEXT_PARTITION_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Arc<Partition>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
}

struct Current {
    txn_id: u64,
    owner: ThreadId,
    /// Thread running the drain, once the policy has started it.
    drainer: Option<ThreadId>,
    depth: usize,
    phase: Phase,
    txn: Arc<Mutex<TransactionImpl>>,
}

struct PartitionState {
    current: Option<Current>,
    post_q: VecDeque<Job>,
    processing_post: bool,
}

/// How [`Partition::enter`] satisfied an open request.
pub(crate) enum Entered {
    /// A fresh transaction was registered; the caller owns it.
    Created(Arc<Mutex<TransactionImpl>>),
    /// The calling thread's open transaction was joined at `depth`.
    Joined(Arc<Mutex<TransactionImpl>>, usize),
}

/// A mutually exclusive execution context for transactions.
pub struct Partition {
    id: u64,
    name: String,
    config: FlowConfig,
    policy: Arc<dyn Policy>,
    listeners: Arc<ListenerArena>,
    state: Mutex<PartitionState>,
    released: Condvar,
    counters: StatsCounters,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Partition {
    #[must_use]
    pub fn new(name: impl Into<String>, config: FlowConfig, policy: Arc<dyn Policy>) -> Arc<Self> {
        let partition = Arc::new(Self {
            id: NEXT_PARTITION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            config,
            policy,
            listeners: ListenerArena::new(),
            state: Mutex::new(PartitionState {
                current: None,
                post_q: VecDeque::new(),
                processing_post: false,
            }),
            released: Condvar::new(),
            counters: StatsCounters::default(),
        });
        tracing::debug!(
            partition = partition.id,
            name = %partition.name,
            rank_limit = partition.config.rank_limit,
            "partition created"
        );
        partition
    }

    /// A partition with the default configuration and the global policy.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, FlowConfig::default(), policy::get_global())
    }

    /// The process-wide default partition, created on first use from
    /// [`FlowConfig::from_env`] and the global policy at that moment.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(
            GLOBAL.get_or_init(|| Self::new("global", FlowConfig::from_env(), policy::get_global())),
        )
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    /// Arena holding the listener objects of this partition's graph.
    #[must_use]
    pub fn listeners(&self) -> &Arc<ListenerArena> {
        &self.listeners
    }

    #[must_use]
    pub fn stats(&self) -> PartitionStats {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn has_open_transaction(&self) -> bool {
        lock(&self.state).current.is_some()
    }

    /// Id of the transaction the calling thread has open (and not yet
    /// closing) on this partition.
    #[must_use]
    pub fn current_transaction(&self) -> Option<u64> {
        let me = thread::current().id();
        lock(&self.state)
            .current
            .as_ref()
            .filter(|cur| cur.owner == me && cur.phase == Phase::Open)
            .map(|cur| cur.txn_id)
    }

    #[must_use]
    pub fn pending_posts(&self) -> usize {
        lock(&self.state).post_q.len()
    }

    // ── Deferred queue ───────────────────────────────────────────────

    /// Run `action` once no transaction is in progress on this partition.
    ///
    /// With no transaction registered and no drain in progress, the queue is
    /// drained right away on the calling thread.
    pub fn post(&self, action: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = lock(&self.state);
            state.post_q.push_back(Box::new(action));
            state.current.is_none() && !state.processing_post
        };
        if run_now {
            self.process_deferred();
        }
    }

    /// Drain the deferred queue to completion.
    ///
    /// Returns immediately if another call is already draining; callbacks
    /// appended meanwhile are picked up by that drain.
    pub fn process_deferred(&self) {
        {
            let mut state = lock(&self.state);
            if state.processing_post {
                return;
            }
            state.processing_post = true;
        }
        let mut guard = ProcessingPost {
            partition: self,
            armed: true,
        };
        loop {
            let job = {
                let mut state = lock(&self.state);
                match state.post_q.pop_front() {
                    Some(job) => job,
                    None => {
                        state.processing_post = false;
                        guard.armed = false;
                        break;
                    }
                }
            };
            job();
            self.counters.deferred();
        }
    }

    // ── Current-transaction slot ─────────────────────────────────────

    /// Join the calling thread's open transaction, or wait until the
    /// partition is free and register a fresh one.
    pub(crate) fn enter(self: &Arc<Self>) -> FlowResult<Entered> {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        loop {
            match state.current.as_mut() {
                Some(cur) if cur.owner == me && cur.phase == Phase::Open => {
                    cur.depth += 1;
                    self.counters.nested();
                    return Ok(Entered::Joined(Arc::clone(&cur.txn), cur.depth));
                }
                Some(cur) if cur.owner == me || cur.drainer == Some(me) => {
                    return Err(FlowError::ReentrantDrain { partition: self.id });
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }

        let txn = TransactionImpl::new(Arc::clone(self));
        let txn_id = txn.id();
        let txn = Arc::new(Mutex::new(txn));
        state.current = Some(Current {
            txn_id,
            owner: me,
            drainer: None,
            depth: 1,
            phase: Phase::Open,
            txn: Arc::clone(&txn),
        });
        drop(state);

        self.counters.opened();
        tracing::debug!(partition = self.id, txn = txn_id, "transaction opened");
        self.policy.initiate(&lock(&txn));
        Ok(Entered::Created(txn))
    }

    /// Leave one nesting level of `txn_id`.
    ///
    /// Returns `true` when this was the last open handle. The transaction is
    /// then closing and no further joins are possible; the caller must drain
    /// or abandon it.
    pub(crate) fn leave(&self, txn_id: u64) -> bool {
        let mut state = lock(&self.state);
        let Some(cur) = state.current.as_mut() else {
            return false;
        };
        if cur.txn_id != txn_id || cur.phase != Phase::Open {
            return false;
        }
        cur.depth = cur.depth.saturating_sub(1);
        if cur.depth > 0 {
            return false;
        }
        cur.phase = Phase::Closing;
        true
    }

    /// Record the calling thread as the one draining `txn_id`.
    pub(crate) fn mark_drainer(&self, txn_id: u64) {
        let mut state = lock(&self.state);
        if let Some(cur) = state.current.as_mut()
            && cur.txn_id == txn_id
        {
            cur.drainer = Some(thread::current().id());
        }
    }

    /// Unregister `txn_id` after a completed drain and wake waiters.
    pub(crate) fn complete(&self, txn_id: u64, report: &TransactionReport) {
        if self.release(txn_id) {
            self.counters.completed(report);
            tracing::debug!(
                partition = self.id,
                txn = txn_id,
                drained = report.entries_drained,
                refiled = report.entries_refiled,
                finals = report.final_actions,
                "transaction closed"
            );
        }
    }

    /// Unregister `txn_id` without draining it. A no-op if it is no longer
    /// registered.
    pub(crate) fn abandon(&self, txn_id: u64, reason: &str) {
        if self.release(txn_id) {
            self.counters.abandoned();
            tracing::warn!(partition = self.id, txn = txn_id, reason, "transaction abandoned");
        }
    }

    fn release(&self, txn_id: u64) -> bool {
        let released = {
            let mut state = lock(&self.state);
            match &state.current {
                Some(cur) if cur.txn_id == txn_id => state.current.take(),
                _ => None,
            }
        };
        let Some(current) = released else {
            return false;
        };
        self.released.notify_all();
        // Dropping the transaction may drop undrained user closures.
        drop(current);
        true
    }
}

/// Resets `processing_post` if a deferred callback unwinds.
struct ProcessingPost<'a> {
    partition: &'a Partition,
    armed: bool,
}

impl Drop for ProcessingPost<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.partition.state).processing_post = false;
        }
    }
}
