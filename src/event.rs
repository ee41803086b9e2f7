use tokio::sync::mpsc;

use crate::model::Scope;

/// Notices the engine raises for the UI (toasts, status bar).
///
/// None of these require action; they are never part of the render path.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// A write could not reach the server and was queued
  QueuedOffline {
    display_value: String,
    operation: &'static str,
  },
  /// The server refused a user action
  ActionFailed {
    display_value: String,
    reason: String,
  },
  /// Connectivity changed
  Online(bool),
  /// Queued writes were replayed
  OutboxReplayed { replayed: usize, remaining: usize },
  /// Queued writes the server refused during replay
  OutboxRejected { count: usize },
  /// A background refresh failed; cached data is still shown
  RefreshFailed { scope: Scope, reason: String },
}

/// Receiving half of the engine's notice stream.
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventStream {
  pub(crate) fn channel() -> (mpsc::UnboundedSender<SyncEvent>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<SyncEvent> {
    self.rx.recv().await
  }

  /// Take an event if one is waiting
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    self.rx.try_recv().ok()
  }
}
