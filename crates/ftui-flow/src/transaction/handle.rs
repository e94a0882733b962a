#![forbid(unsafe_code)]

//! RAII transaction handles.
//!
//! # Design
//!
//! [`Transaction::open`] either joins the calling thread's open transaction
//! on the partition (nesting depth + 1) or waits until the partition is free
//! and registers a fresh one. Every close or drop leaves one nesting level;
//! whichever handle leaves the last level hands the drain and the
//! deferred-callback run to the partition's [`Policy`](crate::Policy), in
//! whatever order the handles were closed.
//!
//! Handles are tied to the thread that opened them (`!Send`).
//!
//! # Failure Modes
//!
//! - **Panic while open**: if the owning thread is unwinding when the last
//!   handle drops, the transaction is abandoned (logged and unregistered)
//!   instead of drained.
//! - **Panicking action during the drain**: the transaction is abandoned
//!   and the panic continues.
//! - **Dispatch failure**: the transaction is abandoned and
//!   [`FlowError::PolicyWorkerGone`](crate::FlowError::PolicyWorkerGone) is
//!   returned from [`close`](Transaction::close).
//!
//! Code running inside [`Transaction::with`], an action or a handler already
//! holds `&mut TransactionImpl` and should use it. A handle opened there
//! joins the transaction, but its own `with` would find the transaction
//! borrowed and panics.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;

use crate::error::FlowResult;
use crate::lock;
use crate::node::{Firing, Holder, Node};
use crate::partition::{Entered, Partition};
use crate::stats::TransactionReport;
use crate::transaction::TransactionImpl;

/// An open (or joined) transaction on a partition.
pub struct Transaction {
    partition: Arc<Partition>,
    txn: Arc<Mutex<TransactionImpl>>,
    id: u64,
    depth: usize,
    closed: bool,
    _not_send: PhantomData<Rc<()>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("partition", &self.partition.id())
            .field("depth", &self.depth)
            .finish()
    }
}

impl Transaction {
    /// Open a transaction on `partition`, joining this thread's open one if
    /// there is one.
    ///
    /// A joined handle shares the transaction with the handles before it.
    /// It must not be used while an enclosing [`with`](Self::with) on the
    /// same transaction is running: that closure already holds the
    /// `&mut TransactionImpl` to use, and the handle's own `with` (and
    /// everything built on it) panics.
    ///
    /// # Errors
    ///
    /// [`FlowError::ReentrantDrain`](crate::FlowError::ReentrantDrain) if
    /// called while this thread is draining or closing a transaction on
    /// `partition`.
    pub fn open(partition: &Arc<Partition>) -> FlowResult<Self> {
        let (txn, depth) = match partition.enter()? {
            Entered::Created(txn) => (txn, 1),
            Entered::Joined(txn, depth) => (txn, depth),
        };
        let id = lock(&txn).id();
        Ok(Self {
            partition: Arc::clone(partition),
            txn,
            id,
            depth,
            closed: false,
            _not_send: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Nesting level at which this handle was opened; 1 for the handle that
    /// created the transaction.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this handle created the transaction. The drain is run by
    /// whichever handle closes last, which need not be this one.
    #[inline]
    #[must_use]
    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    #[must_use]
    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    /// Run `f` with exclusive access to the transaction.
    ///
    /// # Panics
    ///
    /// If called from inside another `with` on the same transaction.
    pub fn with<R>(&self, f: impl FnOnce(&mut TransactionImpl) -> R) -> R {
        let mut txn = match self.txn.try_lock() {
            Ok(txn) => txn,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("reentrancy invariant: transaction {} is already borrowed", self.id)
            }
        };
        f(&mut txn)
    }

    pub fn prioritized(
        &self,
        target: &Arc<Node>,
        action: impl FnOnce(&mut TransactionImpl) + Send + 'static,
    ) {
        self.with(|tx| {
            tx.prioritized(target, action);
        });
    }

    pub fn last(&self, action: impl FnOnce(&mut TransactionImpl) + Send + 'static) {
        self.with(|tx| tx.last(action));
    }

    pub fn post(&self, action: impl FnOnce() + Send + 'static) {
        self.partition.post(action);
    }

    /// # Errors
    ///
    /// As [`TransactionImpl::link`].
    pub fn link(&self, from: &Node, holder: &Holder, to: &Arc<Node>) -> FlowResult<bool> {
        self.with(|tx| tx.link(from, holder, to))
    }

    pub fn send(&self, node: &Arc<Node>, firing: Firing) {
        self.with(|tx| node.send(tx, firing));
    }

    /// Close this handle. The close that leaves the last nesting level drains
    /// the transaction and returns its report; any other close returns
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`FlowError::PolicyWorkerGone`](crate::FlowError::PolicyWorkerGone)
    /// if the policy could not run the drain. The transaction is abandoned.
    pub fn close(mut self) -> FlowResult<Option<TransactionReport>> {
        self.closed = true;
        self.finish()
    }

    fn finish(&self) -> FlowResult<Option<TransactionReport>> {
        if !self.partition.leave(self.id) {
            return Ok(None);
        }
        if thread::panicking() {
            self.partition.abandon(self.id, "owner panicked");
            return Ok(None);
        }

        let mut abandon = AbandonOnUnwind {
            partition: &self.partition,
            txn_id: self.id,
            armed: true,
        };

        let report_slot: Arc<Mutex<Option<TransactionReport>>> = Arc::default();
        let transactional = {
            let partition = Arc::clone(&self.partition);
            let txn = Arc::clone(&self.txn);
            let slot = Arc::clone(&report_slot);
            let txn_id = self.id;
            Box::new(move || {
                partition.mark_drainer(txn_id);
                let report = lock(&txn).process_transactional();
                partition.complete(txn_id, &report);
                *lock(&slot) = Some(report);
            })
        };
        let post = {
            let partition = Arc::clone(&self.partition);
            Box::new(move || partition.process_deferred())
        };

        let dispatched = self.partition.policy().dispatch(transactional, post);
        abandon.armed = false;
        match dispatched {
            Ok(()) => Ok(lock(&report_slot).take()),
            Err(err) => {
                self.partition.abandon(self.id, "dispatch failed");
                Err(err)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.finish() {
            tracing::warn!(txn = self.id, error = %err, "transaction close failed on drop");
        }
    }
}

/// Unregisters the transaction if the drain unwinds.
struct AbandonOnUnwind<'a> {
    partition: &'a Arc<Partition>,
    txn_id: u64,
    armed: bool,
}

impl Drop for AbandonOnUnwind<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.partition.abandon(self.txn_id, "drain panicked");
        }
    }
}

/// Run `f` inside a transaction on `partition` and close it.
///
/// # Errors
///
/// As [`Transaction::open`] and [`Transaction::close`].
pub fn with_transaction<R>(
    partition: &Arc<Partition>,
    f: impl FnOnce(&mut TransactionImpl) -> R,
) -> FlowResult<R> {
    let transaction = Transaction::open(partition)?;
    let result = transaction.with(f);
    transaction.close()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::error::FlowError;
    use crate::policy::SimplePolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn partition() -> Arc<Partition> {
        Partition::new("handle", FlowConfig::default(), Arc::new(SimplePolicy))
    }

    #[test]
    fn nested_opens_join_and_only_the_outermost_drains() {
        let p = partition();
        let ran = Arc::new(AtomicUsize::new(0));
        let outer = Transaction::open(&p).unwrap();
        let inner = Transaction::open(&p).unwrap();
        assert_eq!(inner.id(), outer.id());
        assert_eq!(inner.depth(), 2);
        assert!(!inner.is_outermost());

        let r = Arc::clone(&ran);
        inner.last(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(inner.close().unwrap(), None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(p.has_open_transaction());

        let report = outer.close().unwrap().expect("outermost close reports");
        assert_eq!(report.final_actions, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!p.has_open_transaction());
        assert_eq!(p.stats().nested_joins, 1);
        assert_eq!(p.stats().transactions_completed, 1);
    }

    #[test]
    fn closing_the_creator_first_keeps_the_transaction_open() {
        let p = partition();
        let ran = Arc::new(AtomicUsize::new(0));
        let outer = Transaction::open(&p).unwrap();
        let inner = Transaction::open(&p).unwrap();

        assert_eq!(outer.close().unwrap(), None);
        assert!(p.has_open_transaction());
        assert_eq!(p.current_transaction(), Some(inner.id()));

        let r = Arc::clone(&ran);
        inner.last(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // A later open still joins the surviving transaction.
        let late = Transaction::open(&p).unwrap();
        assert_eq!(late.id(), inner.id());
        drop(late);

        drop(inner);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!p.has_open_transaction());
        assert_eq!(p.stats().transactions_completed, 1);
        assert_eq!(p.stats().transactions_abandoned, 0);
    }

    #[test]
    fn drop_closes() {
        let p = partition();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let tx = Transaction::open(&p).unwrap();
            let r = Arc::clone(&ran);
            tx.last(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!p.has_open_transaction());
    }

    #[test]
    fn opening_from_a_drain_is_rejected() {
        let p = partition();
        let seen = Arc::new(Mutex::new(None));
        let (p2, s2) = (Arc::clone(&p), Arc::clone(&seen));
        with_transaction(&p, move |tx| {
            tx.last(move |_| {
                *s2.lock().unwrap() = Some(Transaction::open(&p2).map(|_| ()));
            });
        })
        .unwrap();
        assert!(matches!(
            *seen.lock().unwrap(),
            Some(Err(FlowError::ReentrantDrain { .. }))
        ));
    }

    #[test]
    fn posts_run_after_unregistration() {
        let p = partition();
        let observed = Arc::new(Mutex::new(None));
        let (p2, o2) = (Arc::clone(&p), Arc::clone(&observed));
        with_transaction(&p, move |tx| {
            tx.post(move || {
                *o2.lock().unwrap() = Some(p2.has_open_transaction());
            });
        })
        .unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(false));
    }

    #[test]
    fn panic_while_open_abandons() {
        let p = partition();
        let ran = Arc::new(AtomicUsize::new(0));
        let (p2, r2) = (Arc::clone(&p), Arc::clone(&ran));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let tx = Transaction::open(&p2).unwrap();
            tx.last(move |_| {
                r2.fetch_add(1, Ordering::SeqCst);
            });
            panic!("caller failed");
        }));
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!p.has_open_transaction());
        assert_eq!(p.stats().transactions_abandoned, 1);

        // The partition is usable again.
        assert_eq!(with_transaction(&p, |_| 5).unwrap(), 5);
    }

    #[test]
    fn panicking_action_abandons_and_frees_the_partition() {
        let p = partition();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = with_transaction(&p, |tx| {
                tx.last(|_| panic!("action failed"));
            });
        }));
        assert!(result.is_err());
        assert!(!p.has_open_transaction());
        assert_eq!(p.stats().transactions_abandoned, 1);
    }

    #[test]
    fn abandoned_firings_do_not_accumulate() {
        let p = partition();
        let node = crate::node::Node::new();
        let n2 = Arc::clone(&node);
        let p2 = Arc::clone(&p);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let tx = Transaction::open(&p2).unwrap();
            tx.send(&n2, Arc::new(1_u32));
            panic!("caller failed");
        }));
        assert!(result.is_err());

        for _ in 0..2 {
            with_transaction(&p, |tx| {
                node.send(tx, Arc::new(2_u32));
                assert_eq!(node.firings().len(), 1);
            })
            .unwrap();
            assert!(node.firings().is_empty());
        }
    }
}
