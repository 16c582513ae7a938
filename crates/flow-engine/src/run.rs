//! Per-run bookkeeping
//!
//! A [`RunContext`] is created by `start()` and shared by every control
//! path of that run. It owns the cancellation token, the pause switch, the
//! task tracker the paths are spawned on and the first recorded failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{FlowEngineError, Result};
use crate::types::NodeId;

/// Why a run ended in `Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub node_id: Option<NodeId>,
    pub message: String,
}

impl RunFailure {
    pub fn new(node_id: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            node_id,
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(node_id) => write!(f, "{} (node '{}')", self.message, node_id),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Accumulated pause time
#[derive(Debug, Default)]
struct PauseClock {
    closed: Duration,
    since: Option<Instant>,
}

impl PauseClock {
    fn total(&self) -> Duration {
        self.closed + self.since.map(|s| s.elapsed()).unwrap_or_default()
    }
}

pub(crate) struct RunContext {
    id: String,
    started: Instant,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    pub(crate) tracker: TaskTracker,
    aborts: Mutex<Vec<AbortHandle>>,
    pauses: Mutex<PauseClock>,
    active: Mutex<HashMap<NodeId, usize>>,
    failure: Mutex<Option<RunFailure>>,
    torn_down: AtomicBool,
}

impl RunContext {
    pub(crate) fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
            paused,
            tracker: TaskTracker::new(),
            aborts: Mutex::new(Vec::new()),
            pauses: Mutex::new(PauseClock::default()),
            active: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Run time spent unpaused
    pub(crate) fn active_elapsed(&self) -> Duration {
        let paused = self.pauses.lock().total();
        self.elapsed().saturating_sub(paused)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        let mut pauses = self.pauses.lock();
        match (paused, pauses.since) {
            (true, None) => pauses.since = Some(Instant::now()),
            (false, Some(since)) => {
                pauses.closed += since.elapsed();
                pauses.since = None;
            }
            _ => {}
        }
        self.paused.send_replace(paused);
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Spawn a path task, keeping its abort handle for emergency stop
    ///
    /// With a `scope`, the task is also tracked there so a node firing a
    /// sub-path can wait for every sibling that sub-path spawns. The run's
    /// tracker always sees it.
    pub(crate) fn spawn<F>(&self, scope: Option<&TaskTracker>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = match scope {
            Some(scope) => scope.spawn(self.tracker.track_future(future)),
            None => self.tracker.spawn(future),
        };
        let mut aborts = self.aborts.lock();
        aborts.retain(|h| !h.is_finished());
        aborts.push(handle.abort_handle());
    }

    #[cfg(test)]
    pub(crate) fn tracked_aborts(&self) -> usize {
        self.aborts.lock().len()
    }

    pub(crate) fn abort_all(&self) {
        for handle in self.aborts.lock().drain(..) {
            handle.abort();
        }
    }

    /// Mark a node as executing; returns whether it already was
    pub(crate) fn enter(&self, node_id: &str) -> bool {
        let mut active = self.active.lock();
        let count = active.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        *count > 1
    }

    pub(crate) fn leave(&self, node_id: &str) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(node_id) {
            *count -= 1;
            if *count == 0 {
                active.remove(node_id);
            }
        }
    }

    pub(crate) fn is_active(&self, node_id: &str) -> bool {
        self.active.lock().contains_key(node_id)
    }

    /// Record why the run failed; the first failure wins
    pub(crate) fn record_failure(&self, failure: RunFailure) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    pub(crate) fn failure(&self) -> Option<RunFailure> {
        self.failure.lock().clone()
    }

    /// Claim the right to tear the run down; only the first caller wins
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    /// Wait while paused; fails once the run is cancelled
    pub(crate) async fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FlowEngineError::Cancelled);
        }
        let mut rx = self.paused.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FlowEngineError::Cancelled),
            resumed = async { rx.wait_for(|paused| !*paused).await.is_ok() } => {
                if resumed {
                    Ok(())
                } else {
                    Err(FlowEngineError::Cancelled)
                }
            }
        }
    }

    /// Sleep for `duration` of unpaused time
    pub(crate) async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut remaining = duration;
        loop {
            self.checkpoint().await?;
            if remaining.is_zero() {
                return Ok(());
            }

            let slice_started = Instant::now();
            let mut rx = self.paused.subscribe();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FlowEngineError::Cancelled),
                _ = tokio::time::sleep(remaining) => return Ok(()),
                _ = async {
                    if rx.wait_for(|paused| *paused).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                } => {
                    remaining = remaining.saturating_sub(slice_started.elapsed());
                    log::debug!("Sleep paused with {:?} remaining", remaining);
                }
            }
        }
    }
}
