use crate::error::QueueError;

use tokio::sync::watch;
use tracing::{error, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
  Closed,
  Open,
  Failed(String),
}

/// One-shot barrier that opens once the queue's submission channel is installed.
///
/// Cloning is cheap; every clone observes the same transition.
#[derive(Debug, Clone)]
pub(crate) struct InitGate {
  rx: watch::Receiver<GateState>,
}

/// The single writer side of an [`InitGate`].
///
/// Dropping it without calling [`GateOpener::open`] fails the gate, so waiters
/// never hang when the loop task is torn down before setup completes.
#[derive(Debug)]
pub(crate) struct GateOpener {
  tx: watch::Sender<GateState>,
  settled: bool,
}

pub(crate) fn init_gate() -> (GateOpener, InitGate) {
  let (tx, rx) = watch::channel(GateState::Closed);
  (GateOpener { tx, settled: false }, InitGate { rx })
}

impl InitGate {
  #[cfg(test)]
  pub(crate) fn is_open(&self) -> bool {
    *self.rx.borrow() == GateState::Open
  }

  /// Waits until the gate opens. Returns `SetupFailed` if it never will.
  pub(crate) async fn wait<E>(&self) -> Result<(), QueueError<E>> {
    let mut rx = self.rx.clone();
    let settled = rx.wait_for(|state| *state != GateState::Closed).await;
    match settled {
      Ok(state) => match &*state {
        GateState::Failed(reason) => Err(QueueError::SetupFailed(reason.clone())),
        _ => Ok(()),
      },
      // The opener is only dropped after settling, so this is a torn-down loop.
      Err(_) => Err(QueueError::SetupFailed("initialization gate dropped".to_string())),
    }
  }
}

impl GateOpener {
  pub(crate) fn open(mut self) {
    trace!("Opening initialization gate.");
    self.settled = true;
    self.tx.send_replace(GateState::Open);
  }

  pub(crate) fn fail(mut self, reason: &str) {
    error!(reason, "Initialization gate failed.");
    self.settled = true;
    self.tx.send_replace(GateState::Failed(reason.to_string()));
  }
}

impl Drop for GateOpener {
  fn drop(&mut self) {
    if !self.settled {
      error!("Queue loop dropped before initialization completed. Failing gate.");
      self
        .tx
        .send_replace(GateState::Failed("queue loop dropped before initialization".to_string()));
    }
  }
}
