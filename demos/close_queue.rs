use serial_orchestra::{QueueError, SerialQueue};
use std::convert::Infallible;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Close Queue Example ---");

  let queue = SerialQueue::new(Handle::current(), Some("close_queue"));

  let mut handles = Vec::new();
  for i in 1..=4 {
    let handle = queue
      .submit(Some(format!("job_{}", i).as_str()), async move {
        info!("Job {} running.", i);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, Infallible>(i)
      })
      .await
      .expect("queue is open");
    handles.push(handle);
  }

  // Cancel one queued job individually before it gets a chance to start.
  handles[2].cancel();

  // Let job 1 start, then close: it finishes, jobs 2 and 4 never run.
  tokio::time::sleep(Duration::from_millis(50)).await;
  info!("Closing queue.");
  queue.close();

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(value) => info!("Task {} returned {}", task_id, value),
      Err(e) if e.is_cancellation() => info!("Task {} never ran: {}", task_id, e),
      Err(e) => info!("Task {} failed: {:?}", task_id, e),
    }
  }

  match queue.dispatch(None, async { Ok::<(), Infallible>(()) }).await {
    Err(QueueError::QueueClosed) => info!("Late submission rejected: queue is closed."),
    other => info!("Unexpected late submission outcome: {:?}", other),
  }

  queue.shutdown().await;
  info!("--- Close Queue Example Finished ---");
}
