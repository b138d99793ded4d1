use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// Grace window between a session's last connection dropping and the
/// deferred offline transition actually running. Short enough that a
/// genuinely-gone user goes offline quickly, long enough to absorb the
/// reconnect most clients do within a second or two of a dropped socket.
const OFFLINE_GRACE: Duration = Duration::from_secs(5);

/// Defers a user's presence transition to `offline` so a brief
/// disconnect/reconnect (page reload, network blip) doesn't flap their
/// status. The gateway calls [`Self::schedule_offline`] when a user's last
/// connection drops and [`Self::cancel_offline`] as soon as any connection
/// for that user is established, including the reconnect racing the
/// pending transition.
pub struct PresenceManager {
    pending: DashMap<i64, JoinHandle<()>>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Schedules `on_offline` to run after the grace window, replacing any
    /// already-pending transition for this user (the common case is a
    /// second connection for the same user dropping before the first
    /// transition fires).
    pub fn schedule_offline<F>(&self, user_id: i64, on_offline: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(OFFLINE_GRACE).await;
            on_offline.await;
        });
        if let Some(previous) = self.pending.insert(user_id, handle) {
            previous.abort();
        }
    }

    /// Cancels a pending offline transition for `user_id`, if any. Called
    /// whenever the user establishes or re-establishes a gateway
    /// connection.
    pub fn cancel_offline(&self, user_id: i64) {
        if let Some((_, handle)) = self.pending.remove(&user_id) {
            handle.abort();
        }
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn offline_transition_runs_after_grace_window() {
        let manager = PresenceManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        manager.schedule_offline(1, async move {
            ran_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!ran.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_offline_prevents_the_transition() {
        let manager = PresenceManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        manager.schedule_offline(1, async move {
            ran_clone.store(true, Ordering::SeqCst);
        });

        manager.cancel_offline(1);
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
