//! Evidence codec.
//!
//! Evidence is the compact, single-line justification recorded next to a
//! gate's status in the ledger table, e.g. `tests: 295/295 pass` or
//! `skipped (docs-only change)`. Each gate declares a [`Grammar`]; the
//! [`EvidenceCodec`] enforces it together with the table invariants (one
//! line, bounded length, escaped `|`, no HTML comment markers).
//!
//! Decoding is fail-closed: the controller records a malformed string as a
//! gate failure rather than accepting it.

mod codec;
mod grammar;

pub use codec::{DEFAULT_MAX_EVIDENCE_LEN, EvidenceCodec, defuse_markers, escape, unescape};
pub use grammar::{Evidence, Grammar, skip_reason};
