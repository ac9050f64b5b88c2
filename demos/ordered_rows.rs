use ordered_worker::{BoxError, CancellationToken, FinalizeError, OrderedWorker, Task, Work};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Parses CSV-ish rows concurrently and appends them to a table in input order.
struct RowParser {
  table: Mutex<Vec<(u64, String, f64)>>,
}

impl Work for RowParser {
  type Input = String;
  type Output = (String, f64);

  fn compute(&self, line: &String, index: u64, cancel: &CancellationToken) -> Result<(String, f64), BoxError> {
    // Uneven work so rows finish out of order.
    let delay = Duration::from_millis(10 * ((index * 7) % 5));
    std::thread::sleep(delay);
    if cancel.is_cancelled() {
      return Err("cancelled".into());
    }
    let (name, value) = line.split_once(',').ok_or("missing comma")?;
    Ok((name.trim().to_string(), value.trim().parse::<f64>()?))
  }

  fn finalize(&self, task: &Task<String, (String, f64)>) -> Result<(), FinalizeError> {
    match task.take_output() {
      Ok((name, value)) => {
        info!("Row {} -> {} = {}", task.index(), name, value);
        self.table.lock().push((task.index(), name, value));
      }
      Err(e) => {
        warn!("Row {} ({:?}) unparsable, storing NaN: {}", task.index(), task.input(), e);
        self.table.lock().push((task.index(), task.input().clone(), f64::NAN));
      }
    }
    Ok(())
  }
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Ordered Rows Example (queue 4, active 2) ---");

  let lines: Vec<String> = ["alpha, 1.5", "beta, 2", "gamma", "delta, 4.25", "epsilon, 5", "zeta, x"]
    .iter()
    .map(|s| s.to_string())
    .collect();

  let worker = OrderedWorker::builder(RowParser {
    table: Mutex::new(Vec::new()),
  })
  .limits(4, 2)
  .name("ordered_rows")
  .build()
  .expect("valid limits");

  match worker.run_blocking(lines) {
    Ok(()) => info!("All rows processed."),
    Err(e) => warn!("Run stopped: {}", e),
  }

  for (index, name, value) in worker.work().table.lock().iter() {
    info!("{:>2} {:<8} {}", index, name, value);
  }
  info!("--- Ordered Rows Example End ---");
}
