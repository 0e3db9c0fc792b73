//! Worker orchestration
//!
//! - `worker` - `DatasetWorker` (event router and completion fan-out) and `run_worker`
//! - `scheduler` - periodic expiry sweep
//! - `metrics` - worker counters

pub mod metrics;
pub mod scheduler;
pub mod worker;

pub use metrics::{WorkerMetrics, WorkerMetricsSnapshot};
pub use scheduler::expiry_sweep_task;
pub use worker::{run_worker, DatasetWorker, WorkerError};
