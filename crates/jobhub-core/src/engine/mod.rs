//! Execution Engine y worker.
mod core;
mod worker;

pub use self::core::{Disposition, ExecutionEngine};
pub(crate) use self::core::queue_limits;
pub use self::worker::{Worker, WorkerSettings};
