#![forbid(unsafe_code)]

//! Transactions: the rank-ordered drain engine and the RAII handle that
//! opens, joins and closes it.

mod engine;
mod handle;

pub use engine::{Action, EntryId, TransactionImpl};
pub use handle::{Transaction, with_transaction};
