use futures::StreamExt;
use serial_orchestra::{SerialQueue, StreamSink, TaskCompletionInfo};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Streaming Example ---");

  let queue = SerialQueue::new(Handle::current(), Some("streaming_queue"));
  queue.add_completion_handler(|info: TaskCompletionInfo| {
    info!(
      "[NOTIFIER] task {} ({:?}, label {:?}) ended as {:?}",
      info.task_id, info.kind, info.label, info.status
    );
  });

  let mut countdown = queue.dispatch_stream(Some("countdown"), |sink: StreamSink<u32, String>| async move {
    for i in (1..=5).rev() {
      tokio::time::sleep(Duration::from_millis(100)).await;
      if !sink.emit(i) {
        return;
      }
    }
    sink.finish();
  });

  // Streams are lazy: the first poll queues the countdown.
  if let Some(first) = countdown.next().await {
    info!("Countdown starts at {:?}", first);
  }

  // Queued behind the stream; it only runs once the countdown has finished.
  let after = {
    let queue = queue.clone();
    tokio::spawn(async move {
      queue
        .dispatch(Some("after_countdown"), async { Ok::<_, String>("liftoff") })
        .await
    })
  };

  while let Some(item) = countdown.next().await {
    match item {
      Ok(value) => info!("Countdown: {}", value),
      Err(e) => info!("Countdown failed: {:?}", e),
    }
  }
  info!("After countdown: {:?}", after.await);

  let ticker = queue.dispatch_stream(Some("ticker"), |sink: StreamSink<u64>| async move {
    let mut tick = 0;
    while sink.emit(tick) {
      tick += 1;
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!("Ticker producer noticed its consumer left.");
  });
  let firsts: Vec<u64> = ticker.take(4).filter_map(|item| async move { item.ok() }).collect().await;
  info!("Took the first ticks {:?} and dropped the stream.", firsts);

  queue.shutdown().await;
  info!("--- Streaming Example Finished ---");
}
