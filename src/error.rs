use thiserror::Error;

/// Boxed error returned by caller-supplied `compute` and `before_submit` steps.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Rejected worker limits. Raised before any work starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{name} must be positive")]
  ZeroLimit { name: &'static str },

  #[error("Queue size must be at least as large as the active count: {max_queue} vs. {max_active}")]
  QueueSmallerThanActive { max_queue: usize, max_active: usize },

  #[error("{name} of {value} exceeds the supported maximum of {max}")]
  LimitTooLarge { name: &'static str, value: usize, max: usize },
}

/// Misuse of the single-use run lifecycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
  #[error("Worker can only run once")]
  AlreadyStarted,

  #[error("Worker has not been started")]
  NotStarted,
}

/// Outcome of a task whose computation did not produce a value.
#[derive(Error, Debug)]
pub enum TaskError {
  #[error("Computation failed: {0}")]
  Failed(#[source] BoxError),

  #[error("Computation panicked")]
  Panicked,

  #[error("Task was cancelled")]
  Cancelled,

  #[error("Task output was already taken")]
  OutputTaken,
}

/// Error raised by a caller's `finalize` step.
#[derive(Error, Debug)]
pub enum FinalizeError {
  /// Aborts the run with a recorded failure.
  #[error("{0}")]
  Failed(#[source] BoxError),

  /// Stops the run as an ordinary cancellation, no failure is recorded.
  #[error("Finalization cancelled")]
  Cancelled,
}

impl From<TaskError> for FinalizeError {
  fn from(err: TaskError) -> Self {
    match err {
      TaskError::Cancelled => FinalizeError::Cancelled,
      other => FinalizeError::Failed(Box::new(other)),
    }
  }
}

impl From<BoxError> for FinalizeError {
  fn from(err: BoxError) -> Self {
    FinalizeError::Failed(err)
  }
}

/// Terminal outcome of `OrderedWorker::run` other than normal completion.
#[derive(Error, Debug)]
pub enum RunError {
  #[error("Submission aborted before item {index}: {source}")]
  SubmissionAborted {
    index: u64,
    #[source]
    source: BoxError,
  },

  #[error("Finalizing item {index} failed: {source}")]
  Finalize {
    index: u64,
    #[source]
    source: BoxError,
  },

  #[error("Finalizing item {index} panicked")]
  FinalizePanicked { index: u64 },

  #[error("Run was cancelled")]
  Cancelled,

  #[error("Run was interrupted while waiting for a permit")]
  Interrupted,

  #[error("Default worker pool could not be started: {0}")]
  PoolUnavailable(#[source] std::io::Error),

  /// The pool discarded a submitted job without running it, e.g. because
  /// its runtime had shut down.
  #[error("Worker pool dropped item {index} without running it")]
  JobDropped { index: u64 },

  #[error(transparent)]
  Usage(#[from] UsageError),
}

impl RunError {
  /// `true` for requested or forced stops, as opposed to failures.
  pub fn is_cancellation(&self) -> bool {
    matches!(self, RunError::Cancelled | RunError::Interrupted)
  }
}
