//! Execution history and up-to-date checks.
//!
//! The [`ExecutionHistoryStore`] keeps, per work unit identity, what the
//! unit's inputs and outputs looked like after its most recent execution. The
//! [`UpToDateChecker`] compares that record with the current state to decide
//! whether the unit has to run again.

mod checker;
mod record;
mod store;

pub use checker::{ChangeReason, CurrentState, UpToDateChecker, UpToDateStatus};
pub use record::{ExecutionHistoryRecord, ExecutionOrigin};
pub use store::ExecutionHistoryStore;
