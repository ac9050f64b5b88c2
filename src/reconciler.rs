use crate::error::{FinalizeError, RunError};
use crate::task::Task;
use crate::work::Work;
use crate::worker::{Shared, TaskRef};

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

/// Bookkeeping guarded by the reconciler's critical section.
///
/// Lives in a `ReentrantMutex<RefCell<_>>` so a `finalize` that cancels the
/// run can re-enter; it is never borrowed across a call into `finalize`.
#[derive(Debug)]
pub(crate) struct OrderingState<I, O> {
  next_finished: u64,
  finished: HashMap<u64, Arc<Task<I, O>>>,
}

impl<I, O> OrderingState<I, O> {
  pub(crate) fn with_capacity(max_queue: usize) -> Self {
    Self {
      next_finished: 0,
      finished: HashMap::with_capacity(max_queue),
    }
  }
}

impl<W: Work> Shared<W> {
  /// Called exactly once per task, on whichever thread moved it into a
  /// terminal state.
  pub(crate) fn reconcile(&self, task: &TaskRef<W>) {
    let index = task.index();
    self.active_tasks.remove(&index);

    let stop_run = {
      let guard = self.ordering.lock();
      self.reconcile_locked(&guard, task)
    };

    self.active_permits.add_permits(1);
    trace!(worker = %self.name, index, "Released active permit.");

    if stop_run {
      self.cancel_run(true);
    }
  }

  /// Returns `true` if a finalize asked for the whole run to stop.
  fn reconcile_locked(&self, state: &RefCell<OrderingState<W::Input, W::Output>>, task: &TaskRef<W>) -> bool {
    let index = task.index();
    if self.controller.is_canceled() {
      trace!(worker = %self.name, index, "Run cancelled, dropping task without finalizing.");
      self.queue_permits.add_permits(1);
      self.discard_finished_locked(state);
      return false;
    }

    {
      let mut ordering = state.borrow_mut();
      if index != ordering.next_finished {
        trace!(
          worker = %self.name,
          index,
          next_finished = ordering.next_finished,
          "Task finished out of order, buffering."
        );
        ordering.finished.insert(index, task.clone());
        self.buffered.store(ordering.finished.len(), Ordering::Relaxed);
        return false;
      }
    }

    let mut next = Some(task.clone());
    while let Some(current) = next {
      if self.controller.is_canceled() {
        trace!(worker = %self.name, index = current.index(), "Run cancelled mid-drain, dropping task.");
        self.queue_permits.add_permits(1);
        self.discard_finished_locked(state);
        return false;
      }

      let stop_run = self.finalize_one(&current);
      self.queue_permits.add_permits(1);

      let mut ordering = state.borrow_mut();
      ordering.next_finished += 1;
      self.finished.store(ordering.next_finished, Ordering::Release);
      if stop_run {
        return true;
      }
      let next_index = ordering.next_finished;
      next = ordering.finished.remove(&next_index);
      self.buffered.store(ordering.finished.len(), Ordering::Relaxed);
    }
    false
  }

  fn finalize_one(&self, task: &TaskRef<W>) -> bool {
    let index = task.index();
    trace!(worker = %self.name, index, "Finalizing task.");
    match panic::catch_unwind(AssertUnwindSafe(|| self.work.finalize(task))) {
      Ok(Ok(())) => false,
      Ok(Err(FinalizeError::Cancelled)) => {
        debug!(worker = %self.name, index, "Finalize requested cancellation of the run.");
        self.controller.mark_canceled();
        true
      }
      Ok(Err(FinalizeError::Failed(source))) => {
        warn!(worker = %self.name, index, error = %source, "Unhandled error in finalize, cancelling run.");
        // Recorded before the flag goes up so `run` reports the failure, not a cancellation.
        self.record_terminal(RunError::Finalize { index, source });
        self.controller.mark_canceled();
        true
      }
      Err(_panic_payload) => {
        error!(worker = %self.name, index, "Finalize panicked, cancelling run.");
        self.record_terminal(RunError::FinalizePanicked { index });
        self.controller.mark_canceled();
        true
      }
    }
  }

  /// Drops everything waiting in the finished buffer, returning its queue permits.
  pub(crate) fn discard_finished(&self) {
    let guard = self.ordering.lock();
    self.discard_finished_locked(&guard);
  }

  fn discard_finished_locked(&self, state: &RefCell<OrderingState<W::Input, W::Output>>) {
    let dropped = {
      let mut ordering = state.borrow_mut();
      let dropped = ordering.finished.len();
      ordering.finished.clear();
      dropped
    };
    if dropped > 0 {
      debug!(worker = %self.name, dropped, "Discarded buffered tasks after cancellation.");
      self.queue_permits.add_permits(dropped);
      self.buffered.store(0, Ordering::Relaxed);
    }
  }

  /// First writer wins; later errors are logged and dropped.
  pub(crate) fn record_terminal(&self, err: RunError) -> bool {
    let mut slot = self.terminal.lock();
    if slot.is_some() {
      debug!(worker = %self.name, error = %err, "Terminal error already recorded, discarding.");
      return false;
    }
    *slot = Some(err);
    true
  }

  pub(crate) fn take_terminal(&self) -> Option<RunError> {
    self.terminal.lock().take()
  }
}
