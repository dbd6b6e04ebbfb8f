//! Sync engine: state machine, conflict handling, retry and the coordinator
//! that drives them.

mod conflict;
mod coordinator;
mod local;
mod machine;
mod retry;

pub use conflict::{detect, resolve, Detection, Resolution};
pub use coordinator::{PullOutcome, SyncCoordinator, SyncStatus, SyncSummary};
pub use local::{DocumentEdit, NewDocument};
pub use machine::StateMachine;
pub use retry::{with_retry, RetryPolicy};
