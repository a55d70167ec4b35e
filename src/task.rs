use crate::error::{QueueError, Rejection};
use crate::handle::CompletionHandle;
use crate::notifier::TaskCompletionStatus;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// A descriptive label for a task, used for diagnostics only.
pub type TaskLabel = String;

/// The type of future that the queue executes.
pub type TaskToExecute<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Which kind of item the queue processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
  /// A single future whose result resolves one awaiting caller (or nobody).
  OneShot,
  /// A producer emitting a sequence of values to a consumer.
  Stream,
}

pub(crate) fn next_task_id() -> u64 {
  NEXT_TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Identity of a queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskMeta {
  pub(crate) task_id: u64,
  pub(crate) label: Option<TaskLabel>,
}

impl TaskMeta {
  pub(crate) fn new(label: Option<&str>) -> Self {
    Self {
      task_id: next_task_id(),
      label: label.map(str::to_string),
    }
  }
}

/// Body of a one-shot item, with its result type erased behind the trait.
pub(crate) trait OneShotJob: Send {
  /// The item's own skip flag.
  fn is_cancelled(&self) -> bool;

  /// Runs the body to completion and resolves the completion handle, if any.
  fn run(self: Box<Self>) -> TaskToExecute<TaskCompletionStatus>;

  /// Resolves the completion handle without running the body.
  fn reject(self: Box<Self>, reason: Rejection);
}

/// Body of a streaming item. Implemented in `stream.rs`.
pub(crate) trait StreamJob: Send {
  /// `true` once the consumer has dropped its end of the sequence.
  fn is_abandoned(&self) -> bool;

  /// Drives the producer and relays its output until it terminates or the
  /// consumer goes away.
  fn run(self: Box<Self>) -> TaskToExecute<TaskCompletionStatus>;

  /// Terminates the consumer's sequence with a failure without invoking the producer.
  fn reject(self: Box<Self>, reason: Rejection);
}

/// A queued unit of work.
pub(crate) enum PendingItem {
  OneShot { meta: TaskMeta, job: Box<dyn OneShotJob> },
  Stream { meta: TaskMeta, job: Box<dyn StreamJob> },
}

impl fmt::Debug for PendingItem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PendingItem")
      .field("kind", &self.kind())
      .field("meta", self.meta())
      .finish_non_exhaustive()
  }
}

impl PendingItem {
  pub(crate) fn meta(&self) -> &TaskMeta {
    match self {
      PendingItem::OneShot { meta, .. } | PendingItem::Stream { meta, .. } => meta,
    }
  }

  pub(crate) fn kind(&self) -> TaskKind {
    match self {
      PendingItem::OneShot { .. } => TaskKind::OneShot,
      PendingItem::Stream { .. } => TaskKind::Stream,
    }
  }

  /// Gives the item its terminal disposition without running it.
  pub(crate) fn reject(self, reason: Rejection) -> (TaskMeta, TaskKind) {
    trace!(?reason, item = ?self, "Rejecting queued item.");
    match self {
      PendingItem::OneShot { meta, job } => {
        job.reject(reason);
        (meta, TaskKind::OneShot)
      }
      PendingItem::Stream { meta, job } => {
        job.reject(reason);
        (meta, TaskKind::Stream)
      }
    }
  }
}

/// A one-shot body together with where its outcome goes.
pub(crate) struct OneShotTask<V, E> {
  future: TaskToExecute<Result<V, E>>,
  token: CancellationToken,
  completion: Option<CompletionHandle<V, E>>,
}

impl<V: Send + 'static, E: Send + 'static> OneShotTask<V, E> {
  pub(crate) fn new(
    future: TaskToExecute<Result<V, E>>,
    token: CancellationToken,
    completion: Option<CompletionHandle<V, E>>,
  ) -> Self {
    Self {
      future,
      token,
      completion,
    }
  }

  pub(crate) fn into_item(self, meta: TaskMeta) -> PendingItem {
    PendingItem::OneShot {
      meta,
      job: Box::new(self),
    }
  }
}

impl<V: Send + 'static, E: Send + 'static> OneShotJob for OneShotTask<V, E> {
  fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  fn run(self: Box<Self>) -> TaskToExecute<TaskCompletionStatus> {
    let OneShotTask {
      future, completion, ..
    } = *self;

    Box::pin(async move {
      let outcome: Result<V, QueueError<E>> = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(task_error)) => Err(QueueError::Task(task_error)),
        Err(_panic_payload) => {
          error!("Task panicked during execution.");
          Err(QueueError::TaskPanicked)
        }
      };
      let status = TaskCompletionStatus::from(&outcome);

      match completion {
        Some(mut completion) => {
          completion.resolve(outcome);
        }
        None => trace!(?status, "Detached task finished; outcome discarded."),
      }
      status
    })
  }

  fn reject(self: Box<Self>, reason: Rejection) {
    if let Some(mut completion) = self.completion {
      completion.resolve(Err(reason.into_error()));
    }
  }
}
