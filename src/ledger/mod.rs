//! The ledger: one PR comment holding the gates table, the hop log and the
//! decision block.
//!
//! [`LedgerStore`] is the only writer. It serializes writers per pull
//! request, merges per gate, and folds any duplicate ledger comment back
//! into the oldest one.

mod document;
mod host;
mod store;

pub use document::{
    DECISION_END, DECISION_START, DecisionBlock, GATES_END, GATES_START, HOPS_END, HOPS_START,
    HopEntry, LedgerDocument,
};
pub use host::{CommentHost, HostedComment, WriteResult};
pub use store::{DEFAULT_CONFLICT_RETRIES, LedgerStore};
