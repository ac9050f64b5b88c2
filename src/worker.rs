use crate::cancel::CancellationController;
use crate::config::WorkerLimits;
use crate::dispatcher::Stop;
use crate::error::{ConfigError, RunError, UsageError};
use crate::handle::CancelHandle;
use crate::pool::{self, WorkerPool};
use crate::reconciler::OrderingState;
use crate::task::Task;
use crate::work::Work;

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::Semaphore;
use tracing::{info, trace};

lazy_static::lazy_static! {
  static ref NEXT_WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

pub(crate) type TaskRef<W> = Arc<Task<<W as Work>::Input, <W as Work>::Output>>;

/// State shared between the dispatcher, pool jobs and cancel handles.
pub(crate) struct Shared<W: Work> {
  pub(crate) name: Arc<String>,
  pub(crate) work: W,
  pub(crate) limits: WorkerLimits,
  pub(crate) active_permits: Semaphore,
  pub(crate) queue_permits: Semaphore,
  pub(crate) active_tasks: DashMap<u64, TaskRef<W>>,
  pub(crate) ordering: ReentrantMutex<RefCell<OrderingState<W::Input, W::Output>>>,
  pub(crate) controller: CancellationController,
  pub(crate) terminal: Mutex<Option<RunError>>,
  pub(crate) submitted: AtomicU64,
  pub(crate) finished: AtomicU64,
  pub(crate) buffered: AtomicUsize,
}

/// Computes a result for every input item concurrently and finalizes the
/// results one at a time, in input order.
///
/// At most `max_active` computations run at once and at most `max_queue`
/// items are submitted but not yet finalized. A worker runs once.
pub struct OrderedWorker<W: Work> {
  shared: Arc<Shared<W>>,
  pool: Option<Arc<dyn WorkerPool>>,
}

/// Configures an [`OrderedWorker`] before it is built.
pub struct WorkerBuilder<W: Work> {
  work: W,
  limits: Option<(usize, usize)>,
  name: Option<String>,
  pool: Option<Arc<dyn WorkerPool>>,
}

impl<W: Work> WorkerBuilder<W> {
  /// Sets the queue and active limits, validated on [`build`](Self::build).
  pub fn limits(mut self, max_queue: usize, max_active: usize) -> Self {
    self.limits = Some((max_queue, max_active));
    self
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Runs computations on `pool` instead of the process-wide default.
  pub fn pool(mut self, pool: impl WorkerPool + 'static) -> Self {
    self.pool = Some(Arc::new(pool));
    self
  }

  pub fn build(self) -> Result<OrderedWorker<W>, ConfigError> {
    let limits = match self.limits {
      Some((max_queue, max_active)) => WorkerLimits::new(max_queue, max_active)?,
      None => WorkerLimits::default(),
    };
    let name = self.name.unwrap_or_else(|| {
      let id = NEXT_WORKER_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
      format!("ordered-worker-{}", id)
    });
    Ok(OrderedWorker::from_parts(self.work, limits, name, self.pool))
  }
}

impl<W: Work> OrderedWorker<W> {
  /// Creates a worker with the given limits on the default pool.
  ///
  /// # Errors
  /// Returns a `ConfigError` if either limit is zero or
  /// `max_queue < max_active`.
  pub fn new(work: W, max_queue: usize, max_active: usize) -> Result<Self, ConfigError> {
    Self::builder(work).limits(max_queue, max_active).build()
  }

  pub fn builder(work: W) -> WorkerBuilder<W> {
    WorkerBuilder {
      work,
      limits: None,
      name: None,
      pool: None,
    }
  }

  fn from_parts(work: W, limits: WorkerLimits, name: String, pool: Option<Arc<dyn WorkerPool>>) -> Self {
    let shared = Shared {
      name: Arc::new(name),
      work,
      limits,
      active_permits: Semaphore::new(limits.max_active()),
      queue_permits: Semaphore::new(limits.max_queue()),
      active_tasks: DashMap::with_capacity(limits.max_active()),
      ordering: ReentrantMutex::new(RefCell::new(OrderingState::with_capacity(limits.max_queue()))),
      controller: CancellationController::new(),
      terminal: Mutex::new(None),
      submitted: AtomicU64::new(0),
      finished: AtomicU64::new(0),
      buffered: AtomicUsize::new(0),
    };
    Self {
      shared: Arc::new(shared),
      pool,
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  pub fn limits(&self) -> WorkerLimits {
    self.shared.limits
  }

  pub fn work(&self) -> &W {
    &self.shared.work
  }

  /// Number of items submitted so far. For statistics only.
  pub fn submitted_count(&self) -> u64 {
    self.shared.submitted.load(AtomicOrdering::Acquire)
  }

  /// Number of items that have passed `finalize`. For statistics only.
  pub fn finished_count(&self) -> u64 {
    self.shared.finished.load(AtomicOrdering::Acquire)
  }

  /// Estimate of computations currently holding an active permit.
  pub fn active_count(&self) -> usize {
    self
      .shared
      .limits
      .max_active()
      .saturating_sub(self.shared.active_permits.available_permits())
  }

  /// Number of finished items buffered until their turn to be finalized.
  pub fn pending_finalize_count(&self) -> usize {
    self.shared.buffered.load(AtomicOrdering::Relaxed)
  }

  pub fn is_cancelled(&self) -> bool {
    self.shared.controller.is_canceled()
  }

  pub fn cancel_handle(&self) -> CancelHandle {
    CancelHandle {
      control: self.shared.clone(),
    }
  }

  /// Cancels the run. See [`CancelHandle::cancel`].
  pub fn cancel(&self, may_interrupt: bool) -> Result<(), UsageError> {
    self.cancel_handle().cancel(may_interrupt)
  }

  /// Processes `inputs`, returning once every item has been finalized.
  ///
  /// Dropping the returned future before it completes cancels the run with
  /// interruption.
  ///
  /// # Errors
  /// - `RunError::Usage` if this worker already ran.
  /// - `RunError::SubmissionAborted` if `before_submit` failed; items submitted
  ///   earlier were still finalized.
  /// - `RunError::Finalize` / `RunError::FinalizePanicked` if a `finalize` failed.
  ///   Later items were not finalized.
  /// - `RunError::JobDropped` if the pool discarded a job without running it.
  /// - `RunError::Cancelled` / `RunError::Interrupted` for requested stops.
  pub async fn run<T>(&self, inputs: T) -> Result<(), RunError>
  where
    T: IntoIterator<Item = W::Input>,
  {
    self.shared.controller.mark_started()?;
    let worker_pool = self.resolve_pool()?;
    info!(
      worker = %self.shared.name,
      max_queue = self.shared.limits.max_queue(),
      max_active = self.shared.limits.max_active(),
      "Run started."
    );

    let mut guard = RunGuard {
      shared: &self.shared,
      armed: true,
    };
    let stop = match self.shared.dispatch(inputs, &worker_pool).await {
      Ok(()) => self.shared.drain().await.err(),
      Err(Stop::Aborted(err)) => {
        self.shared.record_terminal(err);
        self.shared.drain().await.err()
      }
      Err(stop) => Some(stop),
    };
    guard.armed = false;

    if matches!(stop, Some(Stop::Interrupted)) {
      self.shared.cancel_run(true);
    }

    let result = match (self.shared.take_terminal(), stop) {
      (Some(err), _) => Err(err),
      (None, Some(Stop::Aborted(err))) => Err(err),
      (None, Some(Stop::Interrupted)) => Err(RunError::Interrupted),
      (None, Some(Stop::Cancelled)) => Err(RunError::Cancelled),
      (None, None) if self.shared.controller.is_canceled() => Err(RunError::Cancelled),
      (None, None) => Ok(()),
    };
    match &result {
      Ok(()) => info!(worker = %self.shared.name, finished = self.finished_count(), "Run completed."),
      Err(err) => info!(worker = %self.shared.name, finished = self.finished_count(), outcome = %err, "Run stopped."),
    }
    result
  }

  /// Blocking form of [`run`](Self::run) for synchronous callers.
  ///
  /// Must not be called from within an async runtime.
  pub fn run_blocking<T>(&self, inputs: T) -> Result<(), RunError>
  where
    T: IntoIterator<Item = W::Input>,
  {
    futures::executor::block_on(self.run(inputs))
  }

  fn resolve_pool(&self) -> Result<Arc<dyn WorkerPool>, RunError> {
    if let Some(custom) = &self.pool {
      return Ok(custom.clone());
    }
    let shared_default: Arc<dyn WorkerPool> = pool::default_pool().map_err(RunError::PoolUnavailable)?;
    Ok(shared_default)
  }
}

impl<W: Work> fmt::Debug for OrderedWorker<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OrderedWorker")
      .field("name", &self.shared.name)
      .field("limits", &self.shared.limits)
      .field("submitted", &self.submitted_count())
      .field("finished", &self.finished_count())
      .field("cancelled", &self.is_cancelled())
      .finish_non_exhaustive()
  }
}

/// Cancels the run if `run`'s future is dropped before it finishes.
struct RunGuard<'a, W: Work> {
  shared: &'a Shared<W>,
  armed: bool,
}

impl<W: Work> Drop for RunGuard<'_, W> {
  fn drop(&mut self) {
    if self.armed {
      info!(worker = %self.shared.name, "Run dropped before completion. Cancelling outstanding tasks.");
      self.shared.cancel_run(true);
    } else {
      trace!(worker = %self.shared.name, "Run guard released.");
    }
  }
}
