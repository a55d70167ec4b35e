use crate::error::Rejection;
use crate::task::PendingItem;

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{error::SendError, UnboundedSender};
use tracing::{debug, trace, warn};

/// Where a submitted item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
  /// Sent straight into the submission channel.
  Forwarded,
  /// Held in the pre-init buffer until the channel is installed.
  Buffered,
  /// The queue no longer accepts work; the item was resolved with `QueueClosed`.
  Rejected,
}

#[derive(Debug, Default)]
struct IngressState {
  buffer: Vec<PendingItem>,
  sender: Option<UnboundedSender<PendingItem>>,
  ready: bool,
  closed: bool,
}

/// The queue's submission side.
///
/// Buffer, ready flag and channel sender live under one lock, so a flush and
/// the ready flip are a single critical section: nothing can be appended to the
/// buffer after the flush starts, and nothing can overtake a buffered item.
#[derive(Debug)]
pub(crate) struct Ingress {
  queue_label: Arc<String>,
  state: Mutex<IngressState>,
  pending: Arc<AtomicUsize>,
}

impl Ingress {
  pub(crate) fn new(queue_label: Arc<String>) -> Self {
    Self {
      queue_label,
      state: Mutex::new(IngressState::default()),
      pending: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Counter of accepted items that have not reached a terminal disposition.
  pub(crate) fn pending_counter(&self) -> Arc<AtomicUsize> {
    self.pending.clone()
  }

  pub(crate) fn pending_count(&self) -> usize {
    self.pending.load(Ordering::Acquire)
  }

  pub(crate) fn is_ready(&self) -> bool {
    self.state.lock().ready
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  /// Accepts an item from any caller. Never blocks on the consumer.
  pub(crate) fn submit(&self, item: PendingItem) -> Submission {
    let rejected = {
      let mut guard = self.state.lock();
      let state = &mut *guard;

      if state.closed {
        item
      } else if let Some(sender) = &state.sender {
        // Count before sending: the loop may finish the item before we return.
        self.pending.fetch_add(1, Ordering::AcqRel);
        match sender.send(item) {
          Ok(()) => return Submission::Forwarded,
          Err(SendError(item)) => {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(queue = %*self.queue_label, task_id = item.meta().task_id, "Submit: Execution loop is gone.");
            item
          }
        }
      } else {
        trace!(
          queue = %*self.queue_label,
          task_id = item.meta().task_id,
          buffered = state.buffer.len() + 1,
          "Submit: Channel not ready, buffering task."
        );
        self.pending.fetch_add(1, Ordering::AcqRel);
        state.buffer.push(item);
        return Submission::Buffered;
      }
    };

    debug!(queue = %*self.queue_label, task_id = rejected.meta().task_id, "Submit: Queue is closed, rejecting task.");
    rejected.reject(Rejection::Closed);
    Submission::Rejected
  }

  /// Installs the channel sender, flushes the pre-init buffer into it in
  /// order, and marks the ingress ready. Returns the number of items flushed.
  ///
  /// If the queue was closed in the meantime the buffer is still flushed (so
  /// the loop can drain it as cancelled) and the sender is dropped afterwards.
  pub(crate) fn install(&self, sender: UnboundedSender<PendingItem>) -> usize {
    let mut state = self.state.lock();
    let buffered = mem::take(&mut state.buffer);
    let flushed = buffered.len();
    let mut undeliverable = Vec::new();

    for item in buffered {
      if let Err(SendError(item)) = sender.send(item) {
        undeliverable.push(item);
      }
    }
    state.buffer.shrink_to_fit();
    state.ready = true;
    if !state.closed {
      state.sender = Some(sender);
    }
    drop(state);

    trace!(queue = %*self.queue_label, flushed, "Pre-init buffer flushed into submission channel.");
    self.reject_all(undeliverable, Rejection::Closed);
    flushed
  }

  /// Stops accepting work and drops the channel sender so the consumer sees
  /// the channel close once it is drained. Returns `false` if already closed.
  pub(crate) fn close(&self) -> bool {
    let mut state = self.state.lock();
    if state.closed {
      return false;
    }
    state.closed = true;
    state.sender = None;
    true
  }

  /// Fails everything still buffered; used when initialization never completes.
  pub(crate) fn abort(&self, reason: &str) -> usize {
    let buffered = {
      let mut state = self.state.lock();
      state.closed = true;
      state.sender = None;
      mem::take(&mut state.buffer)
    };
    let aborted = buffered.len();
    self.reject_all(buffered, Rejection::SetupFailed(reason.to_string()));
    aborted
  }

  fn reject_all(&self, items: Vec<PendingItem>, reason: Rejection) {
    for item in items {
      self.pending.fetch_sub(1, Ordering::AcqRel);
      item.reject(reason.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::tests::detached_item;
  use std::sync::Barrier;
  use std::thread;
  use tokio::sync::mpsc;

  fn ingress() -> Ingress {
    Ingress::new(Arc::new("ingress_test".to_string()))
  }

  fn drain_labels(rx: &mut mpsc::UnboundedReceiver<PendingItem>) -> Vec<String> {
    let mut labels = Vec::new();
    while let Ok(item) = rx.try_recv() {
      labels.push(item.meta().label.clone().unwrap_or_default());
    }
    labels
  }

  #[test]
  fn buffered_items_are_flushed_in_order() {
    let ingress = ingress();
    for label in ["1", "2", "3", "4"] {
      assert_eq!(ingress.submit(detached_item(label)), Submission::Buffered);
    }
    assert!(!ingress.is_ready());
    assert_eq!(ingress.pending_count(), 4);

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert_eq!(ingress.install(tx), 4);
    assert!(ingress.is_ready());
    assert_eq!(ingress.submit(detached_item("5")), Submission::Forwarded);

    assert_eq!(drain_labels(&mut rx), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(ingress.pending_count(), 5);
  }

  #[test]
  fn closed_ingress_rejects_new_items() {
    let ingress = ingress();
    let (tx, mut rx) = mpsc::unbounded_channel();
    ingress.install(tx);

    assert!(ingress.close());
    assert!(!ingress.close());
    assert_eq!(ingress.submit(detached_item("late")), Submission::Rejected);
    assert_eq!(ingress.pending_count(), 0);
    // Sender dropped on close, so the channel reports closed once drained.
    assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
  }

  #[test]
  fn close_before_install_still_flushes_buffer_then_disconnects() {
    let ingress = ingress();
    ingress.submit(detached_item("a"));
    ingress.submit(detached_item("b"));
    ingress.close();

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert_eq!(ingress.install(tx), 2);
    assert_eq!(drain_labels(&mut rx), vec!["a", "b"]);
    assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
  }

  #[test]
  fn abort_empties_the_buffer() {
    let ingress = ingress();
    ingress.submit(detached_item("x"));
    ingress.submit(detached_item("y"));
    assert_eq!(ingress.abort("runtime gone"), 2);
    assert_eq!(ingress.pending_count(), 0);
    assert!(ingress.is_closed());
    assert_eq!(ingress.submit(detached_item("z")), Submission::Rejected);
  }

  #[test]
  fn concurrent_submission_during_install_keeps_per_caller_order() {
    const CALLERS: usize = 8;
    const PER_CALLER: usize = 200;

    let ingress = Arc::new(ingress());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let start = Arc::new(Barrier::new(CALLERS + 1));

    let callers: Vec<_> = (0..CALLERS)
      .map(|caller| {
        let ingress = ingress.clone();
        let start = start.clone();
        thread::spawn(move || {
          start.wait();
          for seq in 0..PER_CALLER {
            ingress.submit(detached_item(&format!("{caller}:{seq}")));
          }
        })
      })
      .collect();

    start.wait();
    // Install while callers are mid-flight.
    thread::yield_now();
    ingress.install(tx);
    for caller in callers {
      caller.join().unwrap();
    }

    let labels = drain_labels(&mut rx);
    assert_eq!(labels.len(), CALLERS * PER_CALLER);

    let mut next_expected = vec![0usize; CALLERS];
    for label in labels {
      let (caller, seq) = label.split_once(':').unwrap();
      let (caller, seq): (usize, usize) = (caller.parse().unwrap(), seq.parse().unwrap());
      assert_eq!(seq, next_expected[caller], "caller {caller} delivered out of order");
      next_expected[caller] += 1;
    }
    assert!(next_expected.iter().all(|&n| n == PER_CALLER));
  }
}
