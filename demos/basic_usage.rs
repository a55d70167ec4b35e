use serial_orchestra::{QueueError, SerialQueue, TaskHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> Result<String, String> {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  if id == 3 {
    return Err(format!("Task {} refused to finish", id));
  }
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  Ok(result)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example ---");

  let queue = SerialQueue::new(Handle::current(), Some("basic_queue"));

  // Accepted before the loop is up; runs first once it is.
  queue.dispatch_detached(Some("warmup"), async {
    info!("Detached warmup task running.");
  });

  let mut handles: Vec<TaskHandle<String, String>> = Vec::new();
  for i in 0..5 {
    // Later tasks sleep less: completion order still follows submission order.
    let sleep_duration: u64 = 400 - (i as u64 * 75);
    match queue.submit(Some(format!("task_{}", i).as_str()), my_task_fn(i, sleep_duration)).await {
      Ok(handle) => {
        info!("Submitted task {} with handle id {}", i, handle.id());
        handles.push(handle);
      }
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  info!("All tasks submitted. Awaiting results...");

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(result) => info!("Result for task {}: {}", task_id, result),
      Err(QueueError::Task(reason)) => info!("Task {} failed: {}", task_id, reason),
      Err(e) => info!("Error for task {}: {:?}", task_id, e),
    }
  }

  let answer: Result<u32, QueueError> = queue.dispatch(Some("answer"), async { Ok(42) }).await;
  info!("Inline dispatch returned {:?}", answer);

  info!("All task results processed. Shutting down queue.");
  queue.shutdown().await;
  info!("--- Basic Usage Example Finished ---");
}
