#![allow(dead_code)]

use ordered_worker::{BoxError, CancelHandle, CancellationToken, FinalizeError, Task, Work};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Marks an item whose compute error was swallowed by finalize.
pub const MISSING: u64 = u64::MAX;

// Helper to initialize tracing for tests (call once per test run, not per test function)
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ordered_worker=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

pub fn input_for(index: u64) -> u64 {
  index * 3 + 1
}

pub fn output_for(input: u64) -> u64 {
  input * 2
}

/// Sleeps in short slices, giving up early once `token` fires.
pub fn sleep_cooperatively(duration: Duration, token: &CancellationToken) -> bool {
  let deadline = Instant::now() + duration;
  while Instant::now() < deadline {
    if token.is_cancelled() {
      return false;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  true
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  condition()
}

/// Everything the test work observes, shared with the test body.
#[derive(Debug, Default)]
pub struct Recorder {
  pub events: Mutex<Vec<String>>,
  pub finalized: Mutex<Vec<(u64, u64)>>,
  pub running: AtomicUsize,
  pub max_running: AtomicUsize,
  pub max_outstanding: AtomicU64,
  pub computed: AtomicU64,
  pub finalize_calls: AtomicU64,
  pub in_finalize: AtomicBool,
  pub overlapping_finalize: AtomicBool,
}

impl Recorder {
  pub fn finalized_indices(&self) -> Vec<u64> {
    self.finalized.lock().iter().map(|(index, _)| *index).collect()
  }

  pub fn finalize_calls(&self) -> u64 {
    self.finalize_calls.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Copy)]
pub enum Delay {
  None,
  Fixed(u64),
  /// Item `i` of `count` sleeps `(count - i) * step_ms`.
  InverseOfIndex { count: u64, step_ms: u64 },
  Random(u64),
}

impl Delay {
  fn for_index(&self, index: u64) -> Duration {
    match *self {
      Delay::None => Duration::ZERO,
      Delay::Fixed(ms) => Duration::from_millis(ms),
      Delay::InverseOfIndex { count, step_ms } => Duration::from_millis(count.saturating_sub(index) * step_ms),
      Delay::Random(max_ms) => Duration::from_millis(rand::rng().random_range(0..=max_ms)),
    }
  }
}

/// Configurable `Work` that records what the worker does with it.
pub struct RecordingWork {
  pub recorder: Arc<Recorder>,
  pub delay: Delay,
  pub cooperative: bool,
  pub log_events: bool,
  pub propagate_compute_errors: bool,
  pub fail_compute_at: Option<u64>,
  pub panic_compute_at: Option<u64>,
  pub fail_submit_at: Option<u64>,
  pub fail_finalize_at: Option<u64>,
  pub panic_finalize_at: Option<u64>,
  pub cancel_finalize_at: Option<u64>,
  pub cancel_from_finalize_at: Option<u64>,
  pub cancel_handle: OnceLock<CancelHandle>,
}

impl RecordingWork {
  pub fn new(recorder: Arc<Recorder>) -> Self {
    Self {
      recorder,
      delay: Delay::None,
      cooperative: false,
      log_events: false,
      propagate_compute_errors: false,
      fail_compute_at: None,
      panic_compute_at: None,
      fail_submit_at: None,
      fail_finalize_at: None,
      panic_finalize_at: None,
      cancel_finalize_at: None,
      cancel_from_finalize_at: None,
      cancel_handle: OnceLock::new(),
    }
  }

  fn log(&self, event: String) {
    if self.log_events {
      self.recorder.events.lock().push(event);
    }
  }
}

impl Work for RecordingWork {
  type Input = u64;
  type Output = u64;

  fn compute(&self, input: &u64, index: u64, cancel: &CancellationToken) -> Result<u64, BoxError> {
    self.log(format!("compute {}", index));
    let now_running = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
    self.recorder.max_running.fetch_max(now_running, Ordering::SeqCst);

    let delay = self.delay.for_index(index);
    let finished = if self.cooperative {
      sleep_cooperatively(delay, cancel)
    } else {
      std::thread::sleep(delay);
      true
    };

    self.recorder.running.fetch_sub(1, Ordering::SeqCst);
    self.recorder.computed.fetch_add(1, Ordering::SeqCst);

    if !finished {
      return Err(format!("item {} observed cancellation", index).into());
    }
    if self.panic_compute_at == Some(index) {
      panic!("item {} intentionally panicked", index);
    }
    if self.fail_compute_at == Some(index) {
      return Err(format!("compute failed at {}", index).into());
    }
    Ok(output_for(*input))
  }

  fn finalize(&self, task: &Task<u64, u64>) -> Result<(), FinalizeError> {
    let index = task.index();
    if self.recorder.in_finalize.swap(true, Ordering::SeqCst) {
      self.recorder.overlapping_finalize.store(true, Ordering::SeqCst);
    }
    self.recorder.finalize_calls.fetch_add(1, Ordering::SeqCst);
    self.log(format!("finalize {}", index));

    if self.panic_finalize_at == Some(index) {
      self.recorder.in_finalize.store(false, Ordering::SeqCst);
      panic!("finalize of item {} intentionally panicked", index);
    }
    let result = self.finalize_inner(task);
    self.recorder.in_finalize.store(false, Ordering::SeqCst);
    result
  }

  fn before_submit(&self, _input: &u64, index: u64) -> Result<(), BoxError> {
    let finalized = self.recorder.finalize_calls.load(Ordering::SeqCst);
    self.recorder.max_outstanding.fetch_max(index + 1 - finalized, Ordering::SeqCst);
    self.log(format!("submit {}", index));
    if self.fail_submit_at == Some(index) {
      return Err("submission refused".into());
    }
    Ok(())
  }
}

impl RecordingWork {
  fn finalize_inner(&self, task: &Task<u64, u64>) -> Result<(), FinalizeError> {
    let index = task.index();
    if self.cancel_finalize_at == Some(index) {
      return Err(FinalizeError::Cancelled);
    }
    if self.fail_finalize_at == Some(index) {
      return Err(FinalizeError::Failed("finalize refused".into()));
    }

    let output = match task.take_output() {
      Ok(output) => {
        assert_eq!(output, output_for(*task.input()), "output matched to the wrong input");
        output
      }
      Err(err) if !self.propagate_compute_errors => {
        tracing::info!("Substituting missing value for item {}: {}", index, err);
        MISSING
      }
      Err(err) => return Err(err.into()),
    };
    self.recorder.finalized.lock().push((index, output));

    if self.cancel_from_finalize_at == Some(index) {
      if let Some(handle) = self.cancel_handle.get() {
        handle.cancel(true).expect("run has started");
      }
    }
    Ok(())
  }
}
