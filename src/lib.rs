//! Gatehouse: drives pull requests through quality gates, records the
//! results in a single ledger comment, mirrors them as check runs and
//! decides whether a head commit is ready for promotion.

pub mod checks;
pub mod config;
pub mod errors;
pub mod evidence;
pub mod gates;
pub mod github;
pub mod ledger;
pub mod memory_host;
pub mod pipeline;
pub mod pull_request;
pub mod receipt;
pub mod retry;
pub mod router;
pub mod telemetry;
pub mod util;
