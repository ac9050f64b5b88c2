use crate::error::{RunError, TaskError};
use crate::pool::WorkerPool;
use crate::task::Task;
use crate::work::Work;
use crate::worker::{Shared, TaskRef};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, error, info_span, trace, warn};

/// A submitted task on its way through the pool.
///
/// If the pool drops the job without running it, the task is reconciled as
/// cancelled and the run fails with `RunError::JobDropped` instead of waiting
/// forever for a permit that never comes back.
struct PooledJob<W: Work> {
  shared: Arc<Shared<W>>,
  task: Option<TaskRef<W>>,
}

impl<W: Work> PooledJob<W> {
  fn run(mut self) {
    if let Some(task) = self.task.take() {
      self.shared.execute(task);
    }
  }
}

impl<W: Work> Drop for PooledJob<W> {
  fn drop(&mut self) {
    let Some(task) = self.task.take() else {
      return;
    };
    let index = task.index();
    if task.state().is_terminal() {
      trace!(worker = %self.shared.name, index, "Dropped job's task was already cancelled.");
      return;
    }
    error!(worker = %self.shared.name, index, "Worker pool dropped task without running it, cancelling run.");
    self.shared.record_terminal(RunError::JobDropped { index });
    // The task is still in `active_tasks`, so this reconciles it and returns its permits.
    self.shared.cancel_run(true);
  }
}

/// Why the dispatcher stopped before running out of input.
#[derive(Debug)]
pub(crate) enum Stop {
  Cancelled,
  Interrupted,
  Aborted(RunError),
}

impl<W: Work> Shared<W> {
  /// Walks the input, submitting one task per item under both permit limits.
  pub(crate) async fn dispatch<T>(self: &Arc<Self>, inputs: T, pool: &Arc<dyn WorkerPool>) -> Result<(), Stop>
  where
    T: IntoIterator<Item = W::Input>,
  {
    for input in inputs {
      self.acquire(&self.active_permits, 1).await?;
      if let Err(stop) = self.acquire(&self.queue_permits, 1).await {
        self.active_permits.add_permits(1);
        return Err(stop);
      }
      trace!(worker = %self.name, "Acquired active and queue permits.");

      if self.controller.is_canceled() {
        self.return_submit_permits();
        return Err(Stop::Cancelled);
      }

      let index = self.submitted.load(Ordering::Acquire);
      if let Err(source) = self.work.before_submit(&input, index) {
        warn!(worker = %self.name, index, error = %source, "before_submit failed, stopping submission.");
        self.return_submit_permits();
        return Err(Stop::Aborted(RunError::SubmissionAborted { index, source }));
      }

      let task: TaskRef<W> = Arc::new(Task::new(input, index, self.controller.task_token()));
      self.active_tasks.insert(index, task.clone());
      self.submitted.store(index + 1, Ordering::Release);
      debug!(worker = %self.name, index, "Submitting task to pool.");

      let job = PooledJob {
        shared: self.clone(),
        task: Some(task),
      };
      let span = info_span!("ordered_task", worker = %self.name, index);
      pool.enqueue(Box::new(move || {
        let _entered = span.enter();
        job.run();
      }));
    }
    Ok(())
  }

  /// Waits until every submitted task has been finalized or dropped.
  pub(crate) async fn drain(&self) -> Result<(), Stop> {
    let all = u32::try_from(self.limits.max_queue()).unwrap_or(u32::MAX);
    trace!(worker = %self.name, permits = all, "Input exhausted, waiting for outstanding tasks.");
    self.acquire(&self.queue_permits, all).await?;
    self.queue_permits.add_permits(all as usize);
    Ok(())
  }

  /// Takes `permits` from `semaphore` for good, unless the dispatcher is
  /// interrupted first.
  async fn acquire(&self, semaphore: &Semaphore, permits: u32) -> Result<(), Stop> {
    tokio::select! {
      biased;
      _ = self.controller.interrupted() => Err(self.interrupt_reason()),
      acquired = semaphore.acquire_many(permits) => match acquired {
        Ok(permit) => {
          permit.forget();
          Ok(())
        }
        Err(_) => {
          error!(worker = %self.name, "Permit semaphore closed unexpectedly.");
          Err(Stop::Interrupted)
        }
      },
    }
  }

  fn interrupt_reason(&self) -> Stop {
    if self.controller.is_canceled() {
      Stop::Cancelled
    } else {
      Stop::Interrupted
    }
  }

  fn return_submit_permits(&self) {
    self.active_permits.add_permits(1);
    self.queue_permits.add_permits(1);
  }

  /// Body of a pool job: computes and, unless cancelled meanwhile, reconciles.
  fn execute(&self, task: TaskRef<W>) {
    let index = task.index();
    if !task.start() {
      trace!(worker = %self.name, index, "Task cancelled before it started.");
      return;
    }

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
      self.work.compute(task.input(), index, task.token())
    })) {
      Ok(Ok(output)) => {
        trace!(worker = %self.name, index, "Task computed successfully.");
        Ok(output)
      }
      Ok(Err(source)) => {
        debug!(worker = %self.name, index, error = %source, "Task computation failed.");
        Err(TaskError::Failed(source))
      }
      Err(_panic_payload) => {
        error!(worker = %self.name, index, "Task panicked during computation.");
        Err(TaskError::Panicked)
      }
    };

    if task.complete(outcome) {
      self.reconcile(&task);
    } else {
      trace!(worker = %self.name, index, "Task cancelled while computing, result discarded.");
    }
  }
}
