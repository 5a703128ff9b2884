//! Live connection set of one entry point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::GatewayError;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Every connection runs in its own task; the tracker keeps an abort handle
/// per task so a drain can wait for them or cut them off.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

/// Removes its connection from the tracker when the task ends or is aborted.
struct Tracked {
    tracker: Arc<ConnectionTracker>,
    id: u64,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run one connection on its own task and track it until it finishes.
    /// Returns the connection id.
    pub fn spawn<F>(self: &Arc<Self>, connection: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Tracked {
            tracker: Arc::clone(self),
            id,
        };
        // The connection only starts once its entry is in the set, so a fast
        // task cannot remove itself before it was added. No lock is held
        // across the spawn: a stopping runtime drops the future in place.
        let (registered, wait) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _guard = guard;
            if wait.await.is_ok() {
                connection.await;
            }
        });
        self.connections.lock().insert(id, task.abort_handle());
        if registered.send(()).is_err() {
            self.remove(id);
        }
        id
    }

    fn remove(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Wait until every tracked connection is gone.
    ///
    /// The set is checked every 500ms. Fails with `DeadlineExceeded` once
    /// `deadline` passes, or `Cancelled` when `cancel` resolves first.
    pub async fn shutdown<C>(&self, deadline: Instant, cancel: C) -> Result<(), GatewayError>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let mut ticker = tokio::time::interval(DRAIN_POLL_INTERVAL);
        loop {
            if self.is_empty() {
                return Ok(());
            }
            tokio::select! {
                () = &mut cancel => return Err(GatewayError::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Err(GatewayError::DeadlineExceeded),
                _ = ticker.tick() => {}
            }
        }
    }

    /// Force-close every tracked connection.
    pub fn close(&self) {
        let connections: Vec<(u64, AbortHandle)> = self.connections.lock().drain().collect();
        for (id, handle) in connections {
            tracing::debug!(conn_id = id, "closing connection");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn empty_tracker_drains_immediately() {
        let tracker = ConnectionTracker::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        tracker
            .shutdown(deadline, std::future::pending())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn finished_connections_remove_themselves() {
        let tracker = ConnectionTracker::new();
        tracker.spawn(async { tokio::time::sleep(Duration::from_millis(200)).await });
        assert_eq!(tracker.len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        tracker
            .shutdown(deadline, std::future::pending())
            .await
            .unwrap();
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connection_exceeds_deadline_then_closes() {
        let tracker = ConnectionTracker::new();
        tracker.spawn(std::future::pending());

        let start = Instant::now();
        let err = tracker
            .shutdown(start + Duration::from_millis(50), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::from_millis(50));

        tracker.close();
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_can_be_cancelled() {
        let tracker = ConnectionTracker::new();
        tracker.spawn(std::future::pending());

        let deadline = Instant::now() + Duration::from_secs(60);
        let cancel = tokio::time::sleep(Duration::from_millis(10));
        let err = tracker.shutdown(deadline, cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        tracker.close();
    }

    #[test]
    fn spawning_on_a_stopped_runtime_leaves_nothing_behind() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let handle = rt.handle().clone();
        drop(rt);

        let _entered = handle.enter();
        let tracker = ConnectionTracker::new();
        tracker.spawn(async {});
        assert!(tracker.is_empty());
    }
}
