use crate::error::UsageError;
use crate::handle::RunControl;
use crate::work::Work;
use crate::worker::{Shared, TaskRef};

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, trace};

/// Run-wide cancellation state.
///
/// `canceled` only ever goes from `false` to `true`. `task_tokens` is the
/// parent of every task's token, `interrupt` wakes a dispatcher blocked on a
/// permit.
#[derive(Debug)]
pub(crate) struct CancellationController {
  started: AtomicBool,
  canceled: AtomicBool,
  task_tokens: CancellationToken,
  interrupt: CancellationToken,
}

impl CancellationController {
  pub(crate) fn new() -> Self {
    Self {
      started: AtomicBool::new(false),
      canceled: AtomicBool::new(false),
      task_tokens: CancellationToken::new(),
      interrupt: CancellationToken::new(),
    }
  }

  pub(crate) fn mark_started(&self) -> Result<(), UsageError> {
    self
      .started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .map(|_| ())
      .map_err(|_| UsageError::AlreadyStarted)
  }

  pub(crate) fn ensure_started(&self) -> Result<(), UsageError> {
    if self.started.load(Ordering::Acquire) {
      Ok(())
    } else {
      Err(UsageError::NotStarted)
    }
  }

  /// Raises the cancel flag. Returns `true` for the call that raised it.
  pub(crate) fn mark_canceled(&self) -> bool {
    !self.canceled.swap(true, Ordering::AcqRel)
  }

  pub(crate) fn is_canceled(&self) -> bool {
    self.canceled.load(Ordering::Acquire)
  }

  pub(crate) fn task_token(&self) -> CancellationToken {
    self.task_tokens.child_token()
  }

  pub(crate) fn interrupt_tasks(&self) {
    self.task_tokens.cancel();
  }

  pub(crate) fn interrupt_dispatcher(&self) {
    self.interrupt.cancel();
  }

  pub(crate) fn interrupted(&self) -> WaitForCancellationFuture<'_> {
    self.interrupt.cancelled()
  }
}

impl<W: Work> Shared<W> {
  /// Cancels the run: raises the flag, cancels every active task, drops
  /// anything waiting in the finished buffer and, with `may_interrupt`,
  /// interrupts running computations and the blocked dispatcher.
  ///
  /// Safe to call repeatedly and from any thread, including from inside
  /// `finalize`.
  pub(crate) fn cancel_run(&self, may_interrupt: bool) {
    if self.controller.mark_canceled() {
      info!(worker = %self.name, may_interrupt, "Cancelling run.");
    } else {
      trace!(worker = %self.name, may_interrupt, "Run already cancelled.");
    }
    if may_interrupt {
      self.controller.interrupt_tasks();
    }

    // Reconciling removes from the map, so snapshot it first.
    let active: Vec<TaskRef<W>> = self.active_tasks.iter().map(|entry| entry.value().clone()).collect();
    for task in active {
      if task.cancel(may_interrupt) {
        debug!(worker = %self.name, index = task.index(), "Cancelled active task.");
        self.reconcile(&task);
      }
    }

    self.discard_finished();
    if may_interrupt {
      self.controller.interrupt_dispatcher();
    }
  }
}

impl<W: Work> RunControl for Shared<W> {
  fn cancel(&self, may_interrupt: bool) -> Result<(), UsageError> {
    self.controller.ensure_started()?;
    self.cancel_run(may_interrupt);
    Ok(())
  }

  fn interrupt(&self) -> Result<(), UsageError> {
    self.controller.ensure_started()?;
    debug!(worker = %self.name, "Interrupting dispatcher.");
    self.controller.interrupt_dispatcher();
    Ok(())
  }

  fn is_cancelled(&self) -> bool {
    self.controller.is_canceled()
  }

  fn name(&self) -> &str {
    &self.name
  }
}
