//! Debounced, coalescing refetch for one synchronization domain.
//!
//! Change signals (push notifications, local mutations, connectivity changes) call
//! [`RefetchCoordinator::schedule`]. A burst of signals inside the debounce window
//! becomes one fetch, and while a fetch is running further signals collapse into a
//! single follow-up run:
//!
//! ```text
//! Idle -> Scheduled (timer armed) -> Fetching -> Idle | Scheduled
//! ```
//!
//! # Example
//!
//! ```ignore
//! let engine = engine.clone();
//! let coordinator = RefetchCoordinator::new(debounce, requeue_delay, move || {
//!     let engine = engine.clone();
//!     async move { engine.refresh().await.map_err(|e| e.to_string()) }
//! });
//!
//! coordinator.schedule();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Observable lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  Idle,
  /// Debounce timer armed
  Scheduled,
  /// A fetch is in flight
  Fetching,
  /// Torn down; signals are ignored
  Stopped,
}

/// A boxed future that returns a Result<(), String>
type BoxFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A factory function that creates one fetch + reconcile pass
type FetcherFn = Box<dyn Fn() -> BoxFuture + Send + Sync>;

#[derive(Default)]
struct RefetchState {
  in_flight: bool,
  queued_again: bool,
  timer: Option<JoinHandle<()>>,
  timer_armed: bool,
  stopped: bool,
}

struct Shared {
  state: Mutex<RefetchState>,
  fetcher: FetcherFn,
  debounce: Duration,
  requeue_delay: Duration,
  phase: watch::Sender<SyncPhase>,
}

/// Coalesces refetch requests: at most one fetch in flight plus one queued.
#[derive(Clone)]
pub struct RefetchCoordinator {
  shared: Arc<Shared>,
}

impl RefetchCoordinator {
  /// Create a coordinator around a fetcher.
  ///
  /// The fetcher is called once per run and must read whatever state it needs when
  /// it is called, not when the coordinator was built.
  pub fn new<F, Fut>(debounce: Duration, requeue_delay: Duration, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
  {
    let (phase, _) = watch::channel(SyncPhase::Idle);
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(RefetchState::default()),
        fetcher: Box::new(move || Box::pin(fetcher())),
        debounce,
        requeue_delay,
        phase,
      }),
    }
  }

  /// Restart the debounce timer.
  pub fn schedule(&self) {
    self.arm(self.shared.debounce);
  }

  /// Run a fetch now, or mark one as queued if a fetch is already in flight.
  pub async fn run_now(&self) {
    {
      let mut state = self.state();
      if state.stopped {
        return;
      }
      if state.in_flight {
        if !state.queued_again {
          debug!("fetch in flight, queueing one more");
        }
        state.queued_again = true;
        return;
      }
      state.in_flight = true;
    }
    self.set_phase(SyncPhase::Fetching);

    if let Err(e) = (self.shared.fetcher)().await {
      warn!(error = %e, "background refetch failed");
    }

    let (rerun, armed) = {
      let mut state = self.state();
      state.in_flight = false;
      let rerun = std::mem::take(&mut state.queued_again) && !state.stopped;
      (rerun, state.timer_armed)
    };

    if rerun {
      self.arm(self.shared.requeue_delay);
    } else if armed {
      self.set_phase(SyncPhase::Scheduled);
    } else if !self.is_stopped() {
      self.set_phase(SyncPhase::Idle);
    }
  }

  /// Cancel the pending timer and ignore all further signals.
  ///
  /// A fetch already running finishes, but nothing runs after it.
  pub fn shutdown(&self) {
    let mut state = self.state();
    state.stopped = true;
    state.queued_again = false;
    state.timer_armed = false;
    if let Some(timer) = state.timer.take() {
      timer.abort();
    }
    drop(state);
    self.set_phase(SyncPhase::Stopped);
  }

  pub fn phase(&self) -> watch::Receiver<SyncPhase> {
    self.shared.phase.subscribe()
  }

  pub fn is_in_flight(&self) -> bool {
    self.state().in_flight
  }

  fn is_stopped(&self) -> bool {
    self.state().stopped
  }

  fn arm(&self, delay: Duration) {
    let mut state = self.state();
    if state.stopped {
      return;
    }
    if let Some(timer) = state.timer.take() {
      timer.abort();
    }

    let this = self.clone();
    state.timer = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      this.state().timer_armed = false;
      // The run outlives this timer task so a later abort cannot cancel a fetch
      let runner = this.clone();
      tokio::spawn(async move { runner.run_now().await });
    }));
    state.timer_armed = true;

    let in_flight = state.in_flight;
    drop(state);
    if !in_flight {
      self.set_phase(SyncPhase::Scheduled);
    }
  }

  fn state(&self) -> MutexGuard<'_, RefetchState> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn set_phase(&self, phase: SyncPhase) {
    self.shared.phase.send_replace(phase);
  }
}

impl std::fmt::Debug for RefetchCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RefetchCoordinator")
      .field("debounce", &self.shared.debounce)
      .field("requeue_delay", &self.shared.requeue_delay)
      .field("phase", &*self.shared.phase.borrow())
      .finish_non_exhaustive()
  }
}
