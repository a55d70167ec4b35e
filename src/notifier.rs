use crate::error::QueueError;
use crate::task::{TaskKind, TaskLabel, TaskMeta};

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, info, trace};

// --- Public Event Structs for Handlers ---

/// Terminal disposition of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  /// The body ran and succeeded (for streams: the producer finished).
  Success,
  /// The body ran and returned its own error.
  Failed,
  /// The body ran and panicked.
  Panicked,
  /// The body never ran.
  Cancelled,
  /// A stream's consumer went away while the producer was still emitting.
  Abandoned,
}

impl<V, E> From<&Result<V, QueueError<E>>> for TaskCompletionStatus {
  fn from(result: &Result<V, QueueError<E>>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(QueueError::Task(_)) => TaskCompletionStatus::Failed,
      Err(QueueError::TaskPanicked) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Cancelled,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub queue_label: Arc<String>,
  pub label: Option<TaskLabel>,
  pub kind: TaskKind,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

/// Fans out one notification per processed item to the registered handlers.
///
/// Handlers run on their own spawned tasks, so a slow or panicking handler
/// never holds up the execution loop.
pub(crate) struct CompletionNotifier {
  handlers: RwLock<Vec<CompletionHandler>>,
  tokio_handle: TokioHandle,
  queue_label: Arc<String>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &self.handlers.read().len())
      .field("queue_label", &self.queue_label)
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(tokio_handle: TokioHandle, queue_label: Arc<String>) -> Self {
    Self {
      handlers: RwLock::new(Vec::new()),
      tokio_handle,
      queue_label,
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(queue = %*self.queue_label, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  pub(crate) fn notify(&self, meta: TaskMeta, kind: TaskKind, status: TaskCompletionStatus) {
    let handlers: Vec<CompletionHandler> = self.handlers.read().clone();
    if handlers.is_empty() {
      trace!(task_id = %meta.task_id, "No completion handlers registered, dropping notification.");
      return;
    }

    let public_info = TaskCompletionInfo {
      task_id: meta.task_id,
      queue_label: self.queue_label.clone(),
      label: meta.label,
      kind,
      status,
      completion_time: SystemTime::now(),
    };

    debug!(
      task_id = %public_info.task_id,
      ?status,
      "Dispatching notification to {} handlers.",
      handlers.len()
    );

    for handler in handlers {
      let info_for_handler = public_info.clone();
      self.tokio_handle.spawn(async move {
        let task_id = info_for_handler.task_id;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(info_for_handler)));
        if result.is_err() {
          error!(%task_id, "Completion handler panicked.");
        }
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;
  use std::time::Duration;

  #[test]
  fn status_follows_outcome() {
    assert_eq!(TaskCompletionStatus::from(&Ok::<u8, QueueError<String>>(1)), TaskCompletionStatus::Success);
    assert_eq!(
      TaskCompletionStatus::from(&Err::<u8, _>(QueueError::Task("x".to_string()))),
      TaskCompletionStatus::Failed
    );
    assert_eq!(
      TaskCompletionStatus::from(&Err::<u8, QueueError<String>>(QueueError::TaskPanicked)),
      TaskCompletionStatus::Panicked
    );
    assert_eq!(
      TaskCompletionStatus::from(&Err::<u8, QueueError<String>>(QueueError::QueueClosed)),
      TaskCompletionStatus::Cancelled
    );
  }

  #[tokio::test]
  async fn panicking_handler_does_not_starve_others() {
    let notifier = CompletionNotifier::new(TokioHandle::current(), Arc::new("notifier_unit".to_string()));
    let seen = Arc::new(Mutex::new(Vec::new()));

    notifier.add_handler(|_| panic!("handler exploded"));
    {
      let seen = seen.clone();
      notifier.add_handler(move |info| seen.lock().unwrap().push((info.task_id, info.status)));
    }

    let meta = TaskMeta::new(Some("n"));
    let task_id = meta.task_id;
    notifier.notify(meta, TaskKind::OneShot, TaskCompletionStatus::Success);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*seen.lock().unwrap(), vec![(task_id, TaskCompletionStatus::Success)]);
  }
}
