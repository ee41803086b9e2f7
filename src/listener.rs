//! Forwards push notifications into the refetch coordinator.

use color_eyre::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::SyncDomain;
use crate::push::PushChannel;
use crate::refetch::RefetchCoordinator;

/// Turns change notifications for watched tables into `schedule()` calls.
///
/// It never looks at notification contents beyond the table name, so push-driven
/// and mutation-driven refetches share the same throttling.
pub struct ChangeListener {
  task: JoinHandle<()>,
}

impl ChangeListener {
  pub async fn start(
    channel: Arc<dyn PushChannel>,
    domain: SyncDomain,
    watched_tables: BTreeSet<String>,
    coordinator: RefetchCoordinator,
  ) -> Result<Self> {
    let tables: Vec<String> = watched_tables.iter().cloned().collect();
    let mut notifications = channel.subscribe(&domain, &tables).await?;

    let task = tokio::spawn(async move {
      while let Some(notification) = notifications.recv().await {
        if watched_tables.contains(&notification.table.to_lowercase()) {
          coordinator.schedule();
        } else {
          debug!(table = %notification.table, "ignoring change on unwatched table");
        }
      }
      info!(domain = %domain, "change subscription ended");
    });

    Ok(Self { task })
  }

  /// Cancel the subscription.
  pub fn stop(&self) {
    self.task.abort();
  }

  pub fn is_running(&self) -> bool {
    !self.task.is_finished()
  }
}

impl Drop for ChangeListener {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::push::manual::ManualPush;
  use crate::push::ChangeKind;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn watched(tables: &[&str]) -> BTreeSet<String> {
    tables.iter().map(|t| t.to_string()).collect()
  }

  fn counting_coordinator() -> (RefetchCoordinator, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let coordinator = RefetchCoordinator::new(Duration::from_millis(300), Duration::from_millis(50), move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    });
    (coordinator, count)
  }

  #[tokio::test(start_paused = true)]
  async fn test_notifications_feed_the_coordinator() {
    let push = Arc::new(ManualPush::new());
    let (coordinator, count) = counting_coordinator();

    let listener = ChangeListener::start(
      push.clone(),
      SyncDomain::new("c1"),
      watched(&["establishments", "visits"]),
      coordinator,
    )
    .await
    .unwrap();

    for _ in 0..25 {
      push.emit("visits", ChangeKind::Insert);
      push.emit("Establishments", ChangeKind::Update);
    }
    push.emit("territories", ChangeKind::Delete);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    push.emit("territories", ChangeKind::Delete);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    listener.stop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!listener.is_running());
    assert_eq!(push.subscribers(), 0);
  }
}
