#![forbid(unsafe_code)]

//! Transactional, rank-ordered propagation core for FrankenTUI reactive
//! streams.
//!
//! Independently created event sources feed a shared dependency graph of
//! [`Node`]s. Every update happens inside a [`Transaction`] on a
//! [`Partition`]; inside it, work is drained in ascending node rank so that
//! each listener observes a consistent, glitch-free sequence of updates.
//!
//! # Layers
//!
//! - [`partition`]: mutual exclusion, the current-transaction slot and the
//!   deferred callback queue.
//! - [`node`]: graph vertices, rank maintenance on [`Node::link`].
//! - [`listener`]: reference-counted listener objects with deferred detach.
//! - [`transaction`]: the drain engine ([`TransactionImpl`]) and the RAII
//!   [`Transaction`] handle.
//! - [`policy`]: where a closing transaction is drained.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ftui_flow::{Holder, Node, Partition, with_transaction};
//!
//! let partition = Partition::with_defaults("example");
//! let source = Node::new();
//! let sink = Node::new();
//!
//! with_transaction(&partition, |tx| {
//!     tx.link(&source, &Holder::inert(), &sink).unwrap();
//!     source.send(tx, Arc::new(1_u32));
//! })
//! .unwrap();
//! assert!(source.rank() < sink.rank());
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod error;
pub mod listener;
pub mod node;
pub mod partition;
pub mod policy;
pub mod stats;
pub mod transaction;

pub use config::FlowConfig;
pub use error::{FlowError, FlowResult};
pub use listener::{Cleanup, ListenFn, ListenerArena, ListenerHandle, ListenerRef, RefKind};
pub use node::{Firing, Handler, Holder, HolderKey, Node, NodeId, RANK_MAX, Rank};
pub use partition::Partition;
pub use policy::{Job, Policy, SimplePolicy, ThreadedPolicy};
pub use stats::{PartitionStats, TransactionReport};
pub use transaction::{EntryId, Transaction, TransactionImpl, with_transaction};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
///
/// No lock in this crate is held while user code runs, so a poisoned lock
/// still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
