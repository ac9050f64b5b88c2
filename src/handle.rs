use crate::error::UsageError;

use std::fmt;
use std::sync::Arc;

use tracing;

/// Type-erased cancellation surface of a run.
pub(crate) trait RunControl: Send + Sync {
  fn cancel(&self, may_interrupt: bool) -> Result<(), UsageError>;
  fn interrupt(&self) -> Result<(), UsageError>;
  fn is_cancelled(&self) -> bool;
  fn name(&self) -> &str;
}

/// A cloneable handle for stopping an `OrderedWorker` run from another thread.
///
/// `run` borrows the worker for its whole duration; hand one of these to
/// whoever needs to stop it.
#[derive(Clone)]
pub struct CancelHandle {
  pub(crate) control: Arc<dyn RunControl>,
}

impl CancelHandle {
  /// Returns the name of the worker this handle controls.
  pub fn worker_name(&self) -> &str {
    self.control.name()
  }

  /// Checks if the run has been cancelled, by a caller or by a failing finalize.
  pub fn is_cancelled(&self) -> bool {
    self.control.is_cancelled()
  }

  /// Cancels the run. Idempotent.
  ///
  /// Every active task is cancelled and nothing further is finalized. With
  /// `may_interrupt`, running computations see their cancellation token fire
  /// and a dispatcher blocked on a permit is woken, so `run` returns
  /// `RunError::Cancelled` promptly.
  ///
  /// # Errors
  /// Returns `UsageError::NotStarted` if `run` has not been called yet.
  pub fn cancel(&self, may_interrupt: bool) -> Result<(), UsageError> {
    tracing::debug!(worker = %self.control.name(), may_interrupt, "CancelHandle: Cancellation requested.");
    self.control.cancel(may_interrupt)
  }

  /// Wakes a dispatcher blocked on a permit without requesting cancellation.
  /// The run stops its active tasks and returns `RunError::Interrupted`.
  ///
  /// # Errors
  /// Returns `UsageError::NotStarted` if `run` has not been called yet.
  pub fn interrupt(&self) -> Result<(), UsageError> {
    self.control.interrupt()
  }
}

impl fmt::Debug for CancelHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelHandle")
      .field("worker", &self.control.name())
      .field("cancelled", &self.control.is_cancelled())
      .finish()
  }
}
