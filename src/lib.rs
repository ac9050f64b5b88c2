//! Runs a computation over an input sequence on a bounded worker pool and
//! hands every result to a single-threaded finalize step in input order,
//! exactly once, with backpressure and cooperative cancellation.

mod cancel;
mod config;
mod dispatcher;
mod error;
mod handle;
mod pool;
mod reconciler;
mod task;
mod work;
mod worker;

pub use config::WorkerLimits;
pub use error::{BoxError, ConfigError, FinalizeError, RunError, TaskError, UsageError};
pub use handle::CancelHandle;
pub use pool::{default_pool, Job, RuntimePool, WorkerPool};
pub use task::{Task, TaskState};
pub use tokio_util::sync::CancellationToken;
pub use work::Work;
pub use worker::{OrderedWorker, WorkerBuilder};
