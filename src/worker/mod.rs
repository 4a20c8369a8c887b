//! Worker pool: claim a job, run it through the execution adapter, report.

mod heartbeat;
mod pool;
mod slots;

pub use pool::WorkerPool;
pub use slots::{SlotState, SlotStatus};
