//! Push channel delivering "something changed" signals for a synchronization domain.

mod realtime;

use async_trait::async_trait;
use color_eyre::Result;
use tokio::sync::mpsc;

use crate::model::SyncDomain;

pub use realtime::RealtimeChannel;

/// What happened to a row, as far as the notification tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
  Other,
}

impl ChangeKind {
  pub fn parse(kind: &str) -> Self {
    match kind.to_ascii_uppercase().as_str() {
      "INSERT" => Self::Insert,
      "UPDATE" => Self::Update,
      "DELETE" => Self::Delete,
      _ => Self::Other,
    }
  }
}

/// A change signal. Carries no row data: receivers always refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
  pub table: String,
  pub kind: ChangeKind,
}

/// Source of change notifications.
#[async_trait]
pub trait PushChannel: Send + Sync {
  /// Start receiving notifications for `tables` within `domain`.
  ///
  /// Dropping the receiver ends the subscription.
  async fn subscribe(
    &self,
    domain: &SyncDomain,
    tables: &[String],
  ) -> Result<mpsc::UnboundedReceiver<ChangeNotification>>;
}

#[cfg(test)]
pub(crate) mod manual {
  use super::*;
  use std::sync::Mutex;

  /// Push channel driven by the test.
  #[derive(Default)]
  pub struct ManualPush {
    senders: Mutex<Vec<mpsc::UnboundedSender<ChangeNotification>>>,
  }

  impl ManualPush {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn emit(&self, table: &str, kind: ChangeKind) {
      let notification = ChangeNotification {
        table: table.to_string(),
        kind,
      };
      self
        .senders
        .lock()
        .unwrap()
        .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    pub fn subscribers(&self) -> usize {
      let mut senders = self.senders.lock().unwrap();
      senders.retain(|tx| !tx.is_closed());
      senders.len()
    }
  }

  #[async_trait]
  impl PushChannel for ManualPush {
    async fn subscribe(
      &self,
      _domain: &SyncDomain,
      _tables: &[String],
    ) -> Result<mpsc::UnboundedReceiver<ChangeNotification>> {
      let (tx, rx) = mpsc::unbounded_channel();
      self.senders.lock().unwrap().push(tx);
      Ok(rx)
    }
  }
}
