#![forbid(unsafe_code)]

//! Dispatch policies: where a closing transaction is drained.
//!
//! A [`Policy`] receives two jobs when the outermost [`Transaction`] handle
//! closes: the *transactional* job (drain prioritized entries, run final
//! actions) and the *post* job (unregister the transaction, run the
//! partition's deferred callbacks). It must run them in that order and
//! return only after both finished.
//!
//! - [`SimplePolicy`] runs both jobs on the calling thread.
//! - [`ThreadedPolicy`] drains on a dedicated worker thread, so all graph
//!   work of every partition using it happens on one thread.
//!
//! The process-wide default lives in an [`ArcSwap`] slot, read by
//! [`get_global`] whenever a partition is created without an explicit
//! policy.
//!
//! [`Transaction`]: crate::Transaction

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use arc_swap::ArcSwap;

use crate::error::{FlowError, FlowResult};
use crate::lock;
use crate::transaction::TransactionImpl;

/// A unit of work handed to a policy.
pub type Job = Box<dyn FnOnce() + Send>;

pub trait Policy: Send + Sync + fmt::Debug {
    /// Called once when a fresh transaction becomes current on a partition.
    fn initiate(&self, _txn: &TransactionImpl) {}

    /// Run `transactional`, then `post`, returning once both are done.
    ///
    /// # Errors
    ///
    /// [`FlowError::PolicyWorkerGone`] if the jobs could not be run. The
    /// caller then abandons the transaction.
    fn dispatch(&self, transactional: Job, post: Job) -> FlowResult<()>;
}

/// Drains on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePolicy;

impl Policy for SimplePolicy {
    fn dispatch(&self, transactional: Job, post: Job) -> FlowResult<()> {
        transactional();
        post();
        Ok(())
    }
}

// ── Threaded ────────────────────────────────────────────────────────────

struct Task {
    job: Job,
    done: mpsc::SyncSender<()>,
}

/// Drains every transaction on one dedicated worker thread.
///
/// The calling thread blocks until the drain finishes. Deferred callbacks
/// then run on the calling thread, so a callback may open a new transaction
/// without waiting on the worker. A transaction closed on the worker itself
/// (opened by an action of another partition's drain) is drained inline.
pub struct ThreadedPolicy {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    worker: ThreadId,
}

impl fmt::Debug for ThreadedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedPolicy")
            .field("worker", &self.worker)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ThreadedPolicy {
    /// Spawn the worker thread.
    #[must_use]
    pub fn start(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_loop(rx))
            .expect("failed to spawn dispatch worker thread");
        Self {
            worker: handle.thread().id(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> ThreadId {
        self.worker
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.sender).is_some() && lock(&self.handle).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop accepting work and join the worker once it has finished the
    /// tasks already queued.
    pub fn shutdown(&self) {
        drop(lock(&self.sender).take());
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle
            && thread::current().id() != self.worker
        {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadedPolicy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Policy for ThreadedPolicy {
    fn dispatch(&self, transactional: Job, post: Job) -> FlowResult<()> {
        if thread::current().id() == self.worker {
            transactional();
            post();
            return Ok(());
        }

        let sender = lock(&self.sender)
            .clone()
            .ok_or(FlowError::PolicyWorkerGone)?;
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        sender
            .send(Task {
                job: transactional,
                done: done_tx,
            })
            .map_err(|_| FlowError::PolicyWorkerGone)?;
        if done_rx.recv().is_err() {
            tracing::warn!(worker = ?self.worker, "dispatch worker died during drain");
            return Err(FlowError::PolicyWorkerGone);
        }
        post();
        Ok(())
    }
}

fn worker_loop(rx: mpsc::Receiver<Task>) {
    // Ends when every sender is gone.
    for task in rx {
        (task.job)();
        let _ = task.done.send(());
    }
}

// ── Global default ──────────────────────────────────────────────────────

struct Installed(Arc<dyn Policy>);

static GLOBAL: LazyLock<ArcSwap<Installed>> =
    LazyLock::new(|| ArcSwap::from_pointee(Installed(Arc::new(SimplePolicy))));

/// The policy given to partitions created without one.
#[must_use]
pub fn get_global() -> Arc<dyn Policy> {
    Arc::clone(&GLOBAL.load().0)
}

/// Replace the default policy. Partitions that already exist keep theirs.
pub fn set_global(policy: Arc<dyn Policy>) {
    tracing::debug!(policy = ?policy, "global dispatch policy replaced");
    GLOBAL.store(Arc::new(Installed(policy)));
}
