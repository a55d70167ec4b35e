use crate::error::QueueError;
use crate::task::TaskLabel;

use std::convert::Infallible;
use std::fmt;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{self, trace};

/// Single-resolution link between a queued body and its waiter.
///
/// Only the first call to [`CompletionHandle::resolve`] has any effect. A handle
/// dropped unresolved (its body was torn down with the runtime) resolves the
/// waiter with `QueueError::TaskCancelled`.
pub(crate) struct CompletionHandle<V, E> {
  sender: Option<oneshot::Sender<Result<V, QueueError<E>>>>,
}

impl<V, E> CompletionHandle<V, E> {
  pub(crate) fn new(sender: oneshot::Sender<Result<V, QueueError<E>>>) -> Self {
    Self { sender: Some(sender) }
  }

  /// Delivers `outcome` to the waiter. Returns `false` if the handle had
  /// already been resolved, in which case `outcome` is discarded.
  pub(crate) fn resolve(&mut self, outcome: Result<V, QueueError<E>>) -> bool {
    match self.sender.take() {
      Some(sender) => {
        if sender.send(outcome).is_err() {
          trace!("Result receiver was dropped before the task outcome arrived.");
        }
        true
      }
      None => false,
    }
  }
}

impl<V, E> Drop for CompletionHandle<V, E> {
  fn drop(&mut self) {
    if let Some(sender) = self.sender.take() {
      trace!("Completion handle dropped unresolved. Resolving as cancelled.");
      let _ = sender.send(Err(QueueError::TaskCancelled));
    }
  }
}

/// A handle to a task submitted with [`SerialQueue::submit`](crate::SerialQueue::submit).
///
/// Allows for cancelling the task before it starts and awaiting its result.
/// Dropping a handle whose result has not been received cancels the task the
/// same way [`TaskHandle::cancel`] does.
pub struct TaskHandle<V, E = Infallible> {
  pub(crate) task_id: u64,
  pub(crate) label: Option<TaskLabel>,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<V, QueueError<E>>>>,
  settled: bool,
}

impl<V, E> fmt::Debug for TaskHandle<V, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("task_id", &self.task_id)
      .field("label", &self.label)
      .field("cancelled", &self.cancellation_token.is_cancelled())
      .field("settled", &self.settled)
      .finish_non_exhaustive()
  }
}

impl<V, E> TaskHandle<V, E> {
  pub(crate) fn new(
    task_id: u64,
    label: Option<TaskLabel>,
    cancellation_token: CancellationToken,
    result_receiver: oneshot::Receiver<Result<V, QueueError<E>>>,
  ) -> Self {
    Self {
      task_id,
      label,
      cancellation_token,
      result_receiver: Some(result_receiver),
      settled: false,
    }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Returns the task's label, if it was given one.
  pub fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  /// Checks if cancellation has been requested for this task.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Requests that the task be skipped.
  ///
  /// Has an effect only if the queue has not started the task yet; a running
  /// body is never interrupted. A skipped task resolves with
  /// [`QueueError::TaskCancelled`].
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, "TaskHandle: Cancellation requested.");
    self.cancellation_token.cancel();
  }

  /// Awaits the completion of the task and returns its result.
  ///
  /// # Errors
  /// Returns `QueueError::Task` with the body's own error if the body failed.
  /// Returns `QueueError::TaskPanicked` if the body panicked.
  /// Returns `QueueError::TaskCancelled` if the task was skipped by cancellation.
  /// Returns `QueueError::QueueClosed` if the queue had stopped accepting work.
  /// Returns `QueueError::ResultChannelError` if the queue went away without resolving the task.
  pub async fn await_result(mut self) -> Result<V, QueueError<E>> {
    let outcome = match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(task_outcome) => task_outcome,
        Err(recv_error) => {
          tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", recv_error);
          Err(QueueError::ResultChannelError)
        }
      },
      None => Err(QueueError::ResultChannelError),
    };
    self.settled = true;
    outcome
  }
}

impl<V, E> Drop for TaskHandle<V, E> {
  fn drop(&mut self) {
    if !self.settled && !self.cancellation_token.is_cancelled() {
      trace!(task_id = %self.task_id, "TaskHandle dropped before its result arrived. Cancelling task.");
      self.cancellation_token.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn handle_pair() -> (CompletionHandle<u32, String>, TaskHandle<u32, String>) {
    let (tx, rx) = oneshot::channel();
    let token = CancellationToken::new();
    (CompletionHandle::new(tx), TaskHandle::new(7, Some("unit".into()), token, rx))
  }

  #[tokio::test]
  async fn first_resolution_is_authoritative() {
    let (mut completion, handle) = handle_pair();
    assert!(completion.resolve(Ok(1)));
    assert!(!completion.resolve(Ok(2)));
    assert!(!completion.resolve(Err(QueueError::TaskCancelled)));
    assert_eq!(handle.await_result().await, Ok(1));
  }

  #[tokio::test]
  async fn resolving_after_receiver_dropped_is_harmless() {
    let (mut completion, handle) = handle_pair();
    drop(handle);
    assert!(completion.resolve(Ok(3)));
  }

  #[tokio::test]
  async fn dropped_completion_resolves_as_cancelled() {
    let (completion, handle) = handle_pair();
    drop(completion);
    assert_eq!(handle.await_result().await, Err(QueueError::TaskCancelled));
  }

  #[test]
  fn dropping_unsettled_handle_requests_cancellation() {
    let (_completion, handle) = handle_pair();
    let token = handle.cancellation_token.clone();
    assert_eq!(handle.id(), 7);
    assert_eq!(handle.label(), Some("unit"));
    assert!(!handle.is_cancellation_requested());
    drop(handle);
    assert!(token.is_cancelled());
  }

  #[tokio::test]
  async fn settled_handle_does_not_cancel_on_drop() {
    let (mut completion, handle) = handle_pair();
    let token = handle.cancellation_token.clone();
    completion.resolve(Ok(5));
    assert_eq!(handle.await_result().await, Ok(5));
    assert!(!token.is_cancelled());
  }
}
