use crate::error::{BoxError, FinalizeError};
use crate::task::Task;

use tokio_util::sync::CancellationToken;

/// The per-item steps a caller plugs into an `OrderedWorker`.
///
/// `compute` runs concurrently on pool threads with no ordering between
/// calls. `finalize` is never called concurrently and sees tasks strictly in
/// input order, exactly once each.
pub trait Work: Send + Sync + 'static {
  type Input: Send + Sync + 'static;
  type Output: Send + 'static;

  /// Derives the output for a single input.
  ///
  /// Long computations should poll `cancel` and return early once it fires;
  /// the result of a cancelled task is never finalized.
  fn compute(&self, input: &Self::Input, index: u64, cancel: &CancellationToken) -> Result<Self::Output, BoxError>;

  /// Consumes the next finished task in input order.
  ///
  /// A compute failure surfaces here through [`Task::take_output`]. Swallow it
  /// to keep going, or return it (`?` converts it) to fail the whole run.
  fn finalize(&self, task: &Task<Self::Input, Self::Output>) -> Result<(), FinalizeError>;

  /// Called on the dispatching thread just before an item is submitted.
  /// An error stops submission; items already submitted still drain.
  fn before_submit(&self, _input: &Self::Input, _index: u64) -> Result<(), BoxError> {
    Ok(())
  }
}
