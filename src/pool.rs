use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle as TokioHandle, Runtime};
use tracing::{debug, info};

/// A unit of work handed to a [`WorkerPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs on threads of its choosing.
///
/// Jobs may block; implementations must not run them on an async executor's
/// core threads.
pub trait WorkerPool: Send + Sync {
  fn enqueue(&self, job: Job);
}

impl WorkerPool for TokioHandle {
  fn enqueue(&self, job: Job) {
    self.spawn_blocking(job);
  }
}

impl<P: WorkerPool + ?Sized> WorkerPool for Arc<P> {
  fn enqueue(&self, job: Job) {
    (**self).enqueue(job)
  }
}

lazy_static::lazy_static! {
  static ref DEFAULT_POOL: Mutex<Option<Arc<RuntimePool>>> = Mutex::new(None);
}

const DEFAULT_POOL_NAME: &str = "ordered-worker-pool";

/// Returns the process-wide pool, starting it on first use.
pub fn default_pool() -> io::Result<Arc<RuntimePool>> {
  let mut slot = DEFAULT_POOL.lock();
  if let Some(pool) = slot.as_ref() {
    return Ok(pool.clone());
  }
  let pool = Arc::new(RuntimePool::new(DEFAULT_POOL_NAME)?);
  info!(pool_name = DEFAULT_POOL_NAME, "Started default worker pool.");
  *slot = Some(pool.clone());
  Ok(pool)
}

/// A pool backed by a dedicated tokio runtime's blocking threads.
///
/// Dropping it shuts the runtime down, which must not happen from within an
/// async context.
pub struct RuntimePool {
  name: Arc<String>,
  runtime: Runtime,
}

impl RuntimePool {
  pub fn new(name: &str) -> io::Result<Self> {
    Self::build(name, None)
  }

  /// Like [`RuntimePool::new`] but caps the number of threads running jobs.
  ///
  /// A `max_threads` of zero is treated as one.
  pub fn with_max_threads(name: &str, max_threads: usize) -> io::Result<Self> {
    Self::build(name, Some(max_threads.max(1)))
  }

  fn build(name: &str, max_threads: Option<usize>) -> io::Result<Self> {
    let mut builder = Builder::new_multi_thread();
    builder.worker_threads(1).thread_name(name);
    if let Some(max_threads) = max_threads {
      builder.max_blocking_threads(max_threads);
    }
    let runtime = builder.build()?;
    debug!(pool_name = %name, ?max_threads, "Worker runtime built.");
    Ok(Self {
      name: Arc::new(name.to_string()),
      runtime,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn handle(&self) -> &TokioHandle {
    self.runtime.handle()
  }
}

impl WorkerPool for RuntimePool {
  fn enqueue(&self, job: Job) {
    self.runtime.spawn_blocking(job);
  }
}

impl fmt::Debug for RuntimePool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RuntimePool")
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}
