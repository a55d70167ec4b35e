use crate::error::{QueueError, Rejection};
use crate::gate::{init_gate, GateOpener, InitGate};
use crate::handle::{CompletionHandle, TaskHandle};
use crate::ingress::{Ingress, Submission};
use crate::notifier::{CompletionNotifier, TaskCompletionInfo, TaskCompletionStatus};
use crate::stream::{StreamSink, StreamTask, TaskStream};
use crate::task::{OneShotTask, PendingItem, TaskKind, TaskMeta, TaskToExecute};

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Label used when a queue is constructed without one.
pub const DEFAULT_QUEUE_LABEL: &str = "serial_queue";

/// A serial task queue: accepts work from any number of callers and runs it
/// strictly one item at a time, in submission order, on a single execution loop.
///
/// Work may be submitted immediately after construction. Until the loop has
/// installed its submission channel, items wait in a pre-init buffer and are
/// spliced into the channel in order once it is ready.
pub struct SerialQueue {
  label: Arc<String>,
  ingress: Arc<Ingress>,
  gate: InitGate,
  shutdown_token: CancellationToken,
  notifier: Arc<CompletionNotifier>,
  loop_join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Setup state owned by the loop task until the channel is installed.
///
/// Dropped unfinished (e.g. the runtime shut down before the loop ran), it
/// fails the gate and everything buffered with `SetupFailed`.
struct Startup {
  ingress: Arc<Ingress>,
  opener: Option<GateOpener>,
}

impl Startup {
  fn complete(mut self, sender: mpsc::UnboundedSender<PendingItem>) -> usize {
    let flushed = self.ingress.install(sender);
    if let Some(opener) = self.opener.take() {
      opener.open();
    }
    flushed
  }
}

impl Drop for Startup {
  fn drop(&mut self) {
    if let Some(opener) = self.opener.take() {
      let reason = "execution loop dropped before initialization";
      let aborted = self.ingress.abort(reason);
      error!(aborted, "Queue initialization aborted.");
      opener.fail(reason);
    }
  }
}

/// Receiving side of the running execution loop.
///
/// Dropped while items are still in flight or queued (the runtime shut down
/// under the loop), it closes the ingress and cancels everything left. Those
/// dispositions are not reported to completion handlers.
struct Execution {
  queue_label: Arc<String>,
  ingress: Arc<Ingress>,
  pending: Arc<AtomicUsize>,
  rx: mpsc::UnboundedReceiver<PendingItem>,
  in_flight: Option<(TaskMeta, TaskKind)>,
}

impl Drop for Execution {
  fn drop(&mut self) {
    if self.ingress.close() {
      warn!(queue = %*self.queue_label, "Execution loop torn down while the queue was open. Closing queue.");
    }

    if let Some((meta, kind)) = self.in_flight.take() {
      // The running body was dropped with the loop; its completion handle resolves itself.
      warn!(queue = %*self.queue_label, task_id = %meta.task_id, ?kind, "Running task torn down with the execution loop.");
      self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    self.rx.close();
    let mut abandoned = 0usize;
    while let Ok(item) = self.rx.try_recv() {
      item.reject(Rejection::Cancelled);
      self.pending.fetch_sub(1, Ordering::AcqRel);
      abandoned += 1;
    }
    if abandoned > 0 {
      warn!(queue = %*self.queue_label, abandoned, "Cancelled queued tasks left behind by the execution loop.");
    }
  }
}

impl SerialQueue {
  /// Creates a queue and spawns its execution loop on `tokio_handle`.
  ///
  /// Never fails. The channel is installed asynchronously by the loop task;
  /// see [`SerialQueue::wait_ready`].
  pub fn new(tokio_handle: TokioHandle, label: Option<&str>) -> Arc<Self> {
    let label = Arc::new(label.unwrap_or(DEFAULT_QUEUE_LABEL).to_string());
    let ingress = Arc::new(Ingress::new(label.clone()));
    let (opener, gate) = init_gate();
    let shutdown_token = CancellationToken::new();
    let notifier = Arc::new(CompletionNotifier::new(tokio_handle.clone(), label.clone()));

    let startup = Startup {
      ingress: ingress.clone(),
      opener: Some(opener),
    };
    let loop_join_handle = tokio_handle.spawn(
      Self::run_execution_loop(
        label.clone(),
        startup,
        shutdown_token.clone(),
        notifier.clone(),
      )
      .instrument(info_span!("serial_queue_loop", queue = %label)),
    );

    Arc::new(Self {
      label,
      ingress,
      gate,
      shutdown_token,
      notifier,
      loop_join_handle: Mutex::new(Some(loop_join_handle)),
    })
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  /// `true` once the submission channel is installed and the pre-init buffer flushed.
  pub fn is_ready(&self) -> bool {
    self.ingress.is_ready()
  }

  /// `true` once [`SerialQueue::close`] has been called (or initialization failed).
  pub fn is_closed(&self) -> bool {
    self.ingress.is_closed()
  }

  /// Number of accepted items that have not yet reached a terminal disposition.
  pub fn pending_count(&self) -> usize {
    self.ingress.pending_count()
  }

  /// Waits for the queue's initialization to finish.
  ///
  /// # Errors
  /// Returns `QueueError::SetupFailed` if the execution loop was torn down
  /// before it could install its channel.
  pub async fn wait_ready(&self) -> Result<(), QueueError> {
    self.gate.wait().await
  }

  /// Registers a handler called once for every item the execution loop
  /// disposes of. Handlers run on spawned tasks.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Queues `task_future` without a way to observe its outcome.
  ///
  /// Never suspends and may be called before the queue is ready. The output is
  /// discarded; a panic is logged and does not affect later items.
  pub fn dispatch_detached<F>(&self, label: Option<&str>, task_future: F)
  where
    F: Future + Send + 'static,
  {
    let meta = TaskMeta::new(label);
    let task_id = meta.task_id;
    let future: TaskToExecute<Result<(), Infallible>> = Box::pin(async move {
      task_future.await;
      Ok::<(), Infallible>(())
    });
    let item = OneShotTask::new(future, CancellationToken::new(), None).into_item(meta);

    match self.ingress.submit(item) {
      Submission::Forwarded => debug!(queue = %*self.label, %task_id, "Detached task queued."),
      Submission::Buffered => debug!(queue = %*self.label, %task_id, "Detached task buffered until queue is ready."),
      Submission::Rejected => warn!(queue = %*self.label, %task_id, "Detached task dropped: queue is closed."),
    }
  }

  /// Queues `task_future` and returns a handle to its eventual result.
  ///
  /// Waits for the queue to be ready first, so the earliest callers never
  /// race initialization.
  ///
  /// # Errors
  /// Returns `QueueError::SetupFailed` if the queue never became ready and
  /// `QueueError::QueueClosed` if it has been closed.
  pub async fn submit<V, E, F>(&self, label: Option<&str>, task_future: F) -> Result<TaskHandle<V, E>, QueueError<E>>
  where
    F: Future<Output = Result<V, E>> + Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
  {
    self.gate.wait::<E>().await?;
    if self.ingress.is_closed() {
      warn!(queue = %*self.label, "Submit: Attempted to submit task to a closed queue.");
      return Err(QueueError::QueueClosed);
    }

    let meta = TaskMeta::new(label);
    let token = CancellationToken::new();
    let (result_tx, result_rx) = oneshot::channel::<Result<V, QueueError<E>>>();
    let handle = TaskHandle::new(meta.task_id, meta.label.clone(), token.clone(), result_rx);

    debug!(queue = %*self.label, task_id = %meta.task_id, label = ?meta.label, "Submitting task to queue.");
    let item = OneShotTask::new(Box::pin(task_future), token, Some(CompletionHandle::new(result_tx))).into_item(meta);
    // A close racing this call resolves the handle with `QueueClosed`.
    self.ingress.submit(item);
    Ok(handle)
  }

  /// Queues `task_future` and waits for its result.
  ///
  /// Dropping the returned future before the task starts cancels the task;
  /// its body never runs.
  ///
  /// # Errors
  /// Returns the body's own error as `QueueError::Task`, or any of the
  /// queue-level errors described on [`TaskHandle::await_result`].
  pub async fn dispatch<V, E, F>(&self, label: Option<&str>, task_future: F) -> Result<V, QueueError<E>>
  where
    F: Future<Output = Result<V, E>> + Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
  {
    self.submit(label, task_future).await?.await_result().await
  }

  /// Queues a streaming task. `producer` is invoked by the execution loop with
  /// a [`StreamSink`] once every earlier item has finished; the returned
  /// [`TaskStream`] yields what it emits.
  ///
  /// Nothing is queued until the stream is first polled.
  pub fn dispatch_stream<V, E, P, Fut>(&self, label: Option<&str>, producer: P) -> TaskStream<V, E>
  where
    P: FnOnce(StreamSink<V, E>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
  {
    let meta = TaskMeta::new(label);
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    trace!(queue = %*self.label, task_id = %meta.task_id, "Stream task created; queued on first poll.");
    TaskStream::new(
      meta,
      StreamTask::new(producer, output_tx),
      output_rx,
      self.gate.clone(),
      self.ingress.clone(),
    )
  }

  /// Requests cancellation of all pending work. Idempotent.
  ///
  /// The item currently running (if any) is not interrupted. Everything still
  /// queued resolves with `QueueError::TaskCancelled`, and later submissions
  /// with `QueueError::QueueClosed`.
  pub fn close(&self) {
    self.shutdown_token.cancel();
    if self.ingress.close() {
      info!(queue = %*self.label, "Queue closed. Pending tasks will be cancelled.");
    } else {
      trace!(queue = %*self.label, "Close: Queue already closed.");
    }
  }

  /// Closes the queue and waits for the execution loop to finish draining.
  pub async fn shutdown(&self) {
    self.close();

    let handle_to_await: Option<JoinHandle<()>> = self.loop_join_handle.lock().take();
    match handle_to_await {
      Some(handle) => {
        info!(queue = %*self.label, "Waiting for execution loop to join.");
        match handle.await {
          Ok(()) => info!(queue = %*self.label, "Execution loop successfully joined."),
          Err(join_error) => {
            error!(queue = %*self.label, "Error joining execution loop during shutdown: {:?}", join_error);
          }
        }
      }
      None => trace!(queue = %*self.label, "Execution loop join handle already taken by another shutdown call."),
    }
  }

  async fn run_execution_loop(
    queue_label: Arc<String>,
    startup: Startup,
    shutdown_token: CancellationToken,
    notifier: Arc<CompletionNotifier>,
  ) {
    let (tx, rx) = mpsc::unbounded_channel::<PendingItem>();
    let mut execution = Execution {
      queue_label: queue_label.clone(),
      ingress: startup.ingress.clone(),
      pending: startup.ingress.pending_counter(),
      rx,
      in_flight: None,
    };
    let flushed = startup.complete(tx);
    info!(queue = %*queue_label, flushed, "Submission channel installed. Execution loop started.");

    let settle = |pending: &Arc<AtomicUsize>, meta: TaskMeta, kind: TaskKind, status: TaskCompletionStatus| {
      pending.fetch_sub(1, Ordering::AcqRel);
      notifier.notify(meta, kind, status);
    };

    loop {
      let item = tokio::select! {
        biased;

        _ = shutdown_token.cancelled() => {
          info!(queue = %*queue_label, "Cancellation requested. Execution loop stops running tasks.");
          break;
        }

        received = execution.rx.recv() => match received {
          Some(item) => item,
          None => {
            info!(queue = %*queue_label, "Submission channel closed and empty.");
            break;
          }
        }
      };

      execution.in_flight = Some((item.meta().clone(), item.kind()));
      let (meta, kind, status) = Self::execute(item).await;
      execution.in_flight = None;
      settle(&execution.pending, meta, kind, status);
    }

    // Drain: nothing else runs. Everything still queued fails as cancelled.
    execution.rx.close();
    let mut drained = 0usize;
    while let Some(item) = execution.rx.recv().await {
      let (meta, kind) = item.reject(Rejection::Cancelled);
      debug!(queue = %*queue_label, task_id = %meta.task_id, "Cancelled queued task during drain.");
      settle(&execution.pending, meta, kind, TaskCompletionStatus::Cancelled);
      drained += 1;
    }

    info!(queue = %*queue_label, drained, "Execution loop stopped.");
  }

  /// Runs a single item to completion, unless it was cancelled while queued.
  async fn execute(item: PendingItem) -> (TaskMeta, TaskKind, TaskCompletionStatus) {
    match item {
      PendingItem::OneShot { meta, job } => {
        if job.is_cancelled() {
          debug!(task_id = %meta.task_id, label = ?meta.label, "Dequeued task already cancelled. Skipping.");
          job.reject(Rejection::Cancelled);
          return (meta, TaskKind::OneShot, TaskCompletionStatus::Cancelled);
        }

        debug!(task_id = %meta.task_id, label = ?meta.label, "Dequeued task. Running.");
        let status = job
          .run()
          .instrument(info_span!("queued_task", task_id = %meta.task_id, label = ?meta.label))
          .await;
        trace!(task_id = %meta.task_id, ?status, "Task finished.");
        (meta, TaskKind::OneShot, status)
      }

      PendingItem::Stream { meta, job } => {
        if job.is_abandoned() {
          debug!(task_id = %meta.task_id, label = ?meta.label, "Dequeued stream has no consumer. Skipping.");
          return (meta, TaskKind::Stream, TaskCompletionStatus::Cancelled);
        }

        debug!(task_id = %meta.task_id, label = ?meta.label, "Dequeued stream. Running producer.");
        let status = job
          .run()
          .instrument(info_span!("queued_stream", task_id = %meta.task_id, label = ?meta.label))
          .await;
        trace!(task_id = %meta.task_id, ?status, "Stream finished.");
        (meta, TaskKind::Stream, status)
      }
    }
  }
}

impl Drop for SerialQueue {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        queue = %*self.label,
        "SerialQueue dropped. Initiating implicit close (cancelling pending work, closing ingress)."
      );
      self.close();
    } else {
      trace!(queue = %*self.label, "Drop: Queue already closed. No new signals sent.");
    }
  }
}
