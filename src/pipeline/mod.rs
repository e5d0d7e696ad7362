//! Pipeline controller and supervisor.
//!
//! ```text
//! Idle -> Evaluating(stage) -> Recording -> Retrying  -> Evaluating(stage)
//!                                        -> Routing   -> Evaluating(next)
//!                                        -> Blocked | ReadyForPromotion
//! ```
//!
//! Stages within one pull request run strictly one at a time; the
//! [`Supervisor`] runs different pull requests concurrently.

mod controller;
mod stage;
mod state;
mod supervisor;

pub use controller::{PipelineController, StageBinding};
pub use stage::{CommandStageRunner, StageContext, StageReport, StageRunner};
pub use state::{PipelineState, RunSummary};
pub use supervisor::{HeadResolver, RunHandle, Supervisor, Trigger};
