use crate::error::TaskError;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;
const CANCELED: u8 = 4;

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  /// Created and handed to the pool, not yet picked up.
  Pending,
  /// Accepted by a pool thread, computing.
  Running,
  /// Computation returned a value.
  Completed,
  /// Computation returned an error or panicked.
  Failed,
  /// Cancelled before or during computation.
  Canceled,
}

impl TaskState {
  fn from_tag(tag: u8) -> Self {
    match tag {
      PENDING => TaskState::Pending,
      RUNNING => TaskState::Running,
      COMPLETED => TaskState::Completed,
      FAILED => TaskState::Failed,
      _ => TaskState::Canceled,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Canceled)
  }
}

/// One input item, its sequence index, and the slot its result lands in.
///
/// Handed to `Work::finalize` in input order. The output is read once with
/// [`Task::take_output`].
pub struct Task<I, O> {
  index: u64,
  input: I,
  state: AtomicU8,
  outcome: Mutex<Option<Result<O, TaskError>>>,
  token: CancellationToken,
}

impl<I, O> Task<I, O> {
  pub(crate) fn new(input: I, index: u64, token: CancellationToken) -> Self {
    Self {
      index,
      input,
      state: AtomicU8::new(PENDING),
      outcome: Mutex::new(None),
      token,
    }
  }

  /// Position of this item in the input sequence.
  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn input(&self) -> &I {
    &self.input
  }

  pub fn state(&self) -> TaskState {
    TaskState::from_tag(self.state.load(Ordering::Acquire))
  }

  /// Whether cancellation was requested for this task's computation.
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled() || self.state() == TaskState::Canceled
  }

  /// Takes the computed output, or the error the computation ended with.
  ///
  /// Returns `TaskError::OutputTaken` on every call after the first.
  pub fn take_output(&self) -> Result<O, TaskError> {
    match self.outcome.lock().take() {
      Some(outcome) => outcome,
      None if self.state() == TaskState::Canceled => Err(TaskError::Cancelled),
      None => Err(TaskError::OutputTaken),
    }
  }

  pub(crate) fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// Pending -> Running. Fails if the task was cancelled while queued.
  pub(crate) fn start(&self) -> bool {
    self
      .state
      .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Running -> Completed or Failed. Returns `false` if a cancellation won
  /// the race, in which case the outcome is discarded.
  pub(crate) fn complete(&self, outcome: Result<O, TaskError>) -> bool {
    let target = if outcome.is_ok() { COMPLETED } else { FAILED };
    let mut slot = self.outcome.lock();
    if self
      .state
      .compare_exchange(RUNNING, target, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return false;
    }
    *slot = Some(outcome);
    true
  }

  /// Pending or Running -> Canceled. A no-op on a terminal task.
  ///
  /// Returns `true` only for the call that made the transition; that caller
  /// owes the reconciler its notification.
  pub(crate) fn cancel(&self, may_interrupt: bool) -> bool {
    let mut current = self.state.load(Ordering::Acquire);
    loop {
      if current != PENDING && current != RUNNING {
        return false;
      }
      match self
        .state
        .compare_exchange_weak(current, CANCELED, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => break,
        Err(actual) => current = actual,
      }
    }
    if may_interrupt {
      self.token.cancel();
    }
    true
  }
}

impl<I, O> fmt::Debug for Task<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("index", &self.index)
      .field("state", &self.state())
      .finish_non_exhaustive()
  }
}
