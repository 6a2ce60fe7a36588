//! Domain model (IDs, records, status, strategy, errors).

pub mod entry;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod run;
pub mod state;
pub mod strategy;
pub mod task;

pub use entry::{NewEntry, QueueEntry};
pub use errors::{HandlerError, Result, StoreError, TaskqError};
pub use ids::{EntryId, RunId, TaskId};
pub use retry::RetryPolicy;
pub use run::{Run, RunError, RunErrorKind};
pub use state::TaskStatus;
pub use strategy::{ConcurrencyStrategy, RetryBudget};
pub use task::{HandlerKey, Payload, Task};
