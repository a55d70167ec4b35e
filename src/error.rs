use std::convert::Infallible;

use thiserror::Error;

/// Errors that can occur within a `serial_orchestra` queue.
///
/// `E` is the error type of the submitted body. It is carried through verbatim
/// in [`QueueError::Task`], so callers can tell "ran and failed" apart from
/// "never ran" (see [`QueueError::is_cancellation`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError<E = Infallible> {
  #[error("Task body failed: {0}")]
  Task(E),

  #[error("Submitted task panicked")]
  TaskPanicked,

  #[error("Task was cancelled before it started")]
  TaskCancelled,

  #[error("Queue is closed, cannot accept new tasks")]
  QueueClosed,

  #[error("Queue initialization failed: {0}")]
  SetupFailed(String),

  #[error("Task result channel closed without a result")]
  ResultChannelError,
}

impl<E> QueueError<E> {
  /// `true` if the item never ran because of cancellation or shutdown.
  pub fn is_cancellation(&self) -> bool {
    matches!(self, QueueError::TaskCancelled | QueueError::QueueClosed)
  }

  /// Returns the body's own error, if this is a body failure.
  pub fn into_task_error(self) -> Option<E> {
    match self {
      QueueError::Task(e) => Some(e),
      _ => None,
    }
  }
}

/// Why an item was resolved without its body running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
  /// Skipped: the queue was closed, or the item itself was cancelled.
  Cancelled,
  /// Submitted after the queue stopped accepting work.
  Closed,
  /// The queue never finished initializing.
  SetupFailed(String),
}

impl Rejection {
  pub(crate) fn into_error<E>(self) -> QueueError<E> {
    match self {
      Rejection::Cancelled => QueueError::TaskCancelled,
      Rejection::Closed => QueueError::QueueClosed,
      Rejection::SetupFailed(reason) => QueueError::SetupFailed(reason),
    }
  }
}
