use crate::error::ConfigError;

use std::num::NonZero;

/// Factor applied to the active limit when deriving a default queue size.
const DEFAULT_QUEUE_FACTOR: usize = 10;

/// Upper bound for either limit. The final drain acquires every queue permit
/// in one call, which the semaphore caps at `u32::MAX`.
const MAX_LIMIT: usize = u32::MAX as usize;

/// The two independent concurrency limits of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
  max_queue: usize,
  max_active: usize,
}

impl WorkerLimits {
  /// Validates and creates a new set of limits.
  ///
  /// `max_queue` bounds submitted-but-unfinalized items, `max_active` bounds
  /// computations running at once. Both must be positive and
  /// `max_queue >= max_active`.
  pub fn new(max_queue: usize, max_active: usize) -> Result<Self, ConfigError> {
    if max_queue == 0 {
      return Err(ConfigError::ZeroLimit { name: "max_queue" });
    }
    if max_active == 0 {
      return Err(ConfigError::ZeroLimit { name: "max_active" });
    }
    if max_queue > MAX_LIMIT {
      return Err(ConfigError::LimitTooLarge {
        name: "max_queue",
        value: max_queue,
        max: MAX_LIMIT,
      });
    }
    if max_queue < max_active {
      return Err(ConfigError::QueueSmallerThanActive { max_queue, max_active });
    }
    Ok(Self { max_queue, max_active })
  }

  /// One active computation per available core, with a finished-item queue ten
  /// times that size.
  pub fn for_available_parallelism() -> Self {
    let max_active = std::thread::available_parallelism()
      .map(NonZero::get)
      .unwrap_or(1)
      .min(MAX_LIMIT / DEFAULT_QUEUE_FACTOR);
    Self {
      max_queue: max_active * DEFAULT_QUEUE_FACTOR,
      max_active,
    }
  }

  pub fn max_queue(&self) -> usize {
    self.max_queue
  }

  pub fn max_active(&self) -> usize {
    self.max_active
  }
}

impl Default for WorkerLimits {
  fn default() -> Self {
    Self::for_available_parallelism()
  }
}
