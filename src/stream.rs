use crate::error::{QueueError, Rejection};
use crate::gate::InitGate;
use crate::ingress::Ingress;
use crate::notifier::TaskCompletionStatus;
use crate::task::{PendingItem, StreamJob, TaskMeta, TaskToExecute};

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, FusedStream, Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, trace, warn};

enum SinkEvent<V, E> {
  Item(V),
  Failed(E),
}

/// The emitting side of a streaming task, handed to the producer.
///
/// Terminate it with [`StreamSink::finish`] or [`StreamSink::fail`]; both
/// consume the sink. Dropping an unfinished sink counts as `finish()`.
pub struct StreamSink<V, E = Infallible> {
  tx: UnboundedSender<SinkEvent<V, E>>,
}

impl<V, E> fmt::Debug for StreamSink<V, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StreamSink")
      .field("closed", &self.tx.is_closed())
      .finish()
  }
}

impl<V, E> StreamSink<V, E> {
  /// Emits one value to the consumer.
  ///
  /// Returns `false` if nobody is listening any more (the consumer dropped its
  /// stream, or the queue stopped relaying); the producer should stop then.
  pub fn emit(&self, value: V) -> bool {
    self.tx.send(SinkEvent::Item(value)).is_ok()
  }

  /// `true` once emitted values can no longer reach the consumer.
  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Ends the sequence successfully.
  pub fn finish(self) {
    trace!("StreamSink finished.");
  }

  /// Ends the sequence with the producer's own error.
  pub fn fail(self, error: E) {
    if self.tx.send(SinkEvent::Failed(error)).is_err() {
      trace!("StreamSink failed after the consumer went away.");
    }
  }
}

type Producer<V, E> = Box<dyn FnOnce(StreamSink<V, E>) -> TaskToExecute<()> + Send + 'static>;
type OutputSender<V, E> = UnboundedSender<Result<V, QueueError<E>>>;

/// A producer together with the consumer's end of the relay.
pub(crate) struct StreamTask<V, E> {
  producer: Producer<V, E>,
  output: OutputSender<V, E>,
}

impl<V: Send + 'static, E: Send + 'static> StreamTask<V, E> {
  pub(crate) fn new<P, Fut>(producer: P, output: OutputSender<V, E>) -> Self
  where
    P: FnOnce(StreamSink<V, E>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    Self {
      producer: Box::new(move |sink| Box::pin(producer(sink)) as TaskToExecute<()>),
      output,
    }
  }

  pub(crate) fn into_item(self, meta: TaskMeta) -> PendingItem {
    PendingItem::Stream {
      meta,
      job: Box::new(self),
    }
  }
}

impl<V: Send + 'static, E: Send + 'static> StreamJob for StreamTask<V, E> {
  fn is_abandoned(&self) -> bool {
    self.output.is_closed()
  }

  fn run(self: Box<Self>) -> TaskToExecute<TaskCompletionStatus> {
    let StreamTask { producer, output } = *self;
    Box::pin(relay(producer, output))
  }

  fn reject(self: Box<Self>, reason: Rejection) {
    // A consumer that already left needs no failure.
    let _ = self.output.send(Err(reason.into_error()));
  }
}

/// Drives `producer` and forwards everything it emits to `output`.
///
/// Completes when the sink has terminated and the producer future has returned,
/// or as soon as the consumer drops its end.
async fn relay<V, E>(producer: Producer<V, E>, output: OutputSender<V, E>) -> TaskCompletionStatus {
  let mut teardown = RelayTeardown {
    output: Some(output.clone()),
  };
  let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
  let sink = StreamSink { tx: sink_tx };

  let producer_future = match std::panic::catch_unwind(AssertUnwindSafe(|| producer(sink))) {
    Ok(future) => future,
    Err(_panic_payload) => {
      error!("Stream producer panicked before returning its future.");
      teardown.disarm();
      let _ = output.send(Err(QueueError::TaskPanicked));
      return TaskCompletionStatus::Panicked;
    }
  };
  let mut producer_future = AssertUnwindSafe(producer_future).catch_unwind();
  let mut producer_done = false;

  let status = loop {
    tokio::select! {
      biased;

      _ = output.closed() => {
        warn!("Stream consumer went away. Abandoning producer.");
        break TaskCompletionStatus::Abandoned;
      }

      produced = &mut producer_future, if !producer_done => {
        producer_done = true;
        if produced.is_err() {
          error!("Stream producer panicked during execution.");
          // The panicked future still owns the sink, so the channel never closes.
          break flush_after_panic(&mut sink_rx, &output);
        }
      }

      event = sink_rx.recv() => match event {
        Some(SinkEvent::Item(value)) => {
          if output.send(Ok(value)).is_err() {
            warn!("Stream consumer went away. Abandoning producer.");
            break TaskCompletionStatus::Abandoned;
          }
        }
        Some(SinkEvent::Failed(producer_error)) => {
          let _ = output.send(Err(QueueError::Task(producer_error)));
          break TaskCompletionStatus::Failed;
        }
        None => break TaskCompletionStatus::Success,
      }
    }
  };

  // The consumer sees the end of the sequence as soon as `output` is gone.
  teardown.disarm();
  drop(output);

  if status != TaskCompletionStatus::Abandoned && !producer_done {
    trace!("Stream terminated; waiting for producer future to return.");
    if producer_future.await.is_err() {
      error!("Stream producer panicked after terminating its sink.");
    }
  }
  status
}

/// Fails the consumer's sequence if the relay is dropped before terminating it,
/// so a torn-down relay never reads as a clean finish.
struct RelayTeardown<V, E> {
  output: Option<OutputSender<V, E>>,
}

impl<V, E> RelayTeardown<V, E> {
  fn disarm(&mut self) {
    self.output = None;
  }
}

impl<V, E> Drop for RelayTeardown<V, E> {
  fn drop(&mut self) {
    if let Some(output) = self.output.take() {
      warn!("Stream relay torn down before the sequence terminated.");
      let _ = output.send(Err(QueueError::TaskCancelled));
    }
  }
}

/// Forwards whatever a panicked producer emitted before failing the stream.
fn flush_after_panic<V, E>(
  sink_rx: &mut UnboundedReceiver<SinkEvent<V, E>>,
  output: &OutputSender<V, E>,
) -> TaskCompletionStatus {
  while let Ok(event) = sink_rx.try_recv() {
    match event {
      SinkEvent::Item(value) => {
        if output.send(Ok(value)).is_err() {
          return TaskCompletionStatus::Abandoned;
        }
      }
      SinkEvent::Failed(producer_error) => {
        let _ = output.send(Err(QueueError::Task(producer_error)));
        return TaskCompletionStatus::Failed;
      }
    }
  }
  let _ = output.send(Err(QueueError::TaskPanicked));
  TaskCompletionStatus::Panicked
}

enum RelayState<V, E> {
  Unsubmitted {
    gate: InitGate,
    ingress: Arc<Ingress>,
    item: PendingItem,
    rx: UnboundedReceiver<Result<V, QueueError<E>>>,
  },
  Receiving(UnboundedReceiver<Result<V, QueueError<E>>>),
  Done,
}

/// The consumer side of [`SerialQueue::dispatch_stream`](crate::SerialQueue::dispatch_stream).
///
/// Lazy: nothing is queued until the stream is first polled. Yields every
/// value the producer emits, in order; a failure is always the last item.
/// Dropping the stream early is fine: the queue notices and moves on.
pub struct TaskStream<V, E = Infallible> {
  task_id: u64,
  label: Option<String>,
  inner: BoxStream<'static, Result<V, QueueError<E>>>,
  terminated: bool,
}

impl<V, E> fmt::Debug for TaskStream<V, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskStream")
      .field("task_id", &self.task_id)
      .field("label", &self.label)
      .field("terminated", &self.terminated)
      .finish_non_exhaustive()
  }
}

impl<V: Send + 'static, E: Send + 'static> TaskStream<V, E> {
  pub(crate) fn new(
    meta: TaskMeta,
    task: StreamTask<V, E>,
    rx: UnboundedReceiver<Result<V, QueueError<E>>>,
    gate: InitGate,
    ingress: Arc<Ingress>,
  ) -> Self {
    let task_id = meta.task_id;
    let label = meta.label.clone();
    let initial = RelayState::Unsubmitted {
      gate,
      ingress,
      item: task.into_item(meta),
      rx,
    };

    let inner = stream::unfold(initial, |state| async move {
      let mut rx = match state {
        RelayState::Unsubmitted { gate, ingress, item, rx } => {
          if let Err(setup_error) = gate.wait::<E>().await {
            return Some((Err(setup_error), RelayState::Done));
          }
          debug!(task_id = item.meta().task_id, "Submitting stream task on first poll.");
          ingress.submit(item);
          rx
        }
        RelayState::Receiving(rx) => rx,
        RelayState::Done => return None,
      };

      match rx.recv().await {
        Some(Ok(value)) => Some((Ok(value), RelayState::Receiving(rx))),
        Some(Err(failure)) => Some((Err(failure), RelayState::Done)),
        None => None,
      }
    })
    .boxed();

    Self {
      task_id,
      label,
      inner,
      terminated: false,
    }
  }
}

impl<V, E> TaskStream<V, E> {
  /// Returns the unique ID of the underlying task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Returns the task's label, if it was given one.
  pub fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }
}

impl<V, E> Stream for TaskStream<V, E> {
  type Item = Result<V, QueueError<E>>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    if self.terminated {
      return Poll::Ready(None);
    }
    let polled = self.inner.poll_next_unpin(cx);
    if let Poll::Ready(None) = polled {
      self.terminated = true;
    }
    polled
  }
}

impl<V, E> FusedStream for TaskStream<V, E> {
  fn is_terminated(&self) -> bool {
    self.terminated
  }
}
