//! A Tokio-based serial task queue: futures and streams submitted from any
//! number of callers run strictly one at a time, in submission order, with
//! pre-init buffering and cooperative cancellation.

mod error;
mod gate;
mod handle;
mod ingress;
mod notifier;
mod queue;
mod stream;
mod task;

pub use error::QueueError;
pub use handle::TaskHandle;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use queue::{SerialQueue, DEFAULT_QUEUE_LABEL};
pub use stream::{StreamSink, TaskStream};
pub use task::{TaskKind, TaskLabel, TaskToExecute};
