//! Per-user wake-up signals and connection takeover.
//!
//! Each live connection handler owns one [`WakeSignal`]. The serializer wakes
//! every signal whose user may see a freshly committed tap; the handler then
//! rescans the log from its cursor.
//!
//! The signal holds at most one pending wake-up. Waking an already-woken
//! signal is a no-op, so a burst of commits costs O(1) memory per user.
//!
//! Only one signal per user is registered at a time. Installing a new one
//! displaces the old, and the displaced handler shuts its connection down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// What a handler should do after waiting on its signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// New taps may be visible: rescan from the cursor
    Scan,
    /// A newer connection for the same user took over
    Displaced,
}

/// Single-slot wake-up flag for one connection.
#[derive(Debug)]
pub struct WakeSignal {
    session: Uuid,
    user: String,
    notify: Notify,
    displaced: AtomicBool,
}

impl WakeSignal {
    pub fn new(user: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session: Uuid::new_v4(),
            user: user.into(),
            notify: Notify::new(),
            displaced: AtomicBool::new(false),
        })
    }

    /// Unique id of the connection that owns this signal.
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Request a rescan. Coalesces with any wake-up already pending.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next wake-up.
    pub async fn wait(&self) -> Wake {
        self.notify.notified().await;
        if self.is_displaced() {
            Wake::Displaced
        } else {
            Wake::Scan
        }
    }

    pub fn is_displaced(&self) -> bool {
        self.displaced.load(Ordering::Acquire)
    }

    fn displace(&self) {
        self.displaced.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Maps each connected user to the signal of their one live handler.
pub struct ConnectionRegistry {
    signals: Mutex<HashMap<String, Arc<WakeSignal>>>,
    takeovers: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            signals: Mutex::new(HashMap::new()),
            takeovers: AtomicU64::new(0),
        }
    }

    /// Register `signal` for its user, displacing any previous connection.
    ///
    /// Returns the displaced signal, already invalidated.
    pub async fn install(&self, signal: Arc<WakeSignal>) -> Option<Arc<WakeSignal>> {
        let mut signals = self.signals.lock().await;
        let previous = signals.insert(signal.user().to_string(), signal);
        if let Some(old) = &previous {
            old.displace();
            self.takeovers.fetch_add(1, Ordering::Relaxed);
            log::info!("User '{}' took over session {}", old.user(), old.session());
        }
        previous
    }

    /// Deregister `signal`, unless a newer connection already replaced it.
    pub async fn remove_if_current(&self, signal: &WakeSignal) -> bool {
        let mut signals = self.signals.lock().await;
        match signals.get(signal.user()) {
            Some(current) if current.session() == signal.session() => {
                signals.remove(signal.user());
                true
            }
            _ => false,
        }
    }

    /// Wake every registered user for whom `interested` holds.
    ///
    /// Returns how many signals were woken.
    pub async fn wake_where<F>(&self, interested: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let signals = self.signals.lock().await;
        let mut woken = 0;
        for (user, signal) in signals.iter() {
            if interested(user) {
                signal.wake();
                woken += 1;
            }
        }
        woken
    }

    /// Session id of the user's live connection.
    pub async fn session_of(&self, user: &str) -> Option<Uuid> {
        self.signals.lock().await.get(user).map(|s| s.session())
    }

    /// Users with a live connection.
    pub async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.signals.lock().await.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn len(&self) -> usize {
        self.signals.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.signals.lock().await.is_empty()
    }

    /// Number of takeovers since startup.
    pub fn takeovers(&self) -> u64 {
        self.takeovers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_wake_is_coalesced() {
        let signal = WakeSignal::new("sean");
        signal.wake();
        signal.wake();
        signal.wake();

        assert_eq!(signal.wait().await, Wake::Scan);
        // Only one wake-up was stored.
        let second = timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_wake_before_wait_is_not_lost() {
        let signal = WakeSignal::new("sean");
        signal.wake();
        let woke = timeout(Duration::from_millis(50), signal.wait()).await;
        assert_eq!(woke.unwrap(), Wake::Scan);
    }

    #[tokio::test]
    async fn test_install_displaces_previous() {
        let registry = ConnectionRegistry::new();
        let first = WakeSignal::new("sean");
        let second = WakeSignal::new("sean");

        assert!(registry.install(first.clone()).await.is_none());
        let displaced = registry.install(second.clone()).await.unwrap();

        assert_eq!(displaced.session(), first.session());
        assert!(first.is_displaced());
        assert!(!second.is_displaced());
        assert_eq!(first.wait().await, Wake::Displaced);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.session_of("sean").await, Some(second.session()));
        assert_eq!(registry.takeovers(), 1);
    }

    #[tokio::test]
    async fn test_stale_remove_keeps_newer_registration() {
        let registry = ConnectionRegistry::new();
        let first = WakeSignal::new("sean");
        let second = WakeSignal::new("sean");
        registry.install(first.clone()).await;
        registry.install(second.clone()).await;

        assert!(!registry.remove_if_current(&first).await);
        assert_eq!(registry.session_of("sean").await, Some(second.session()));

        assert!(registry.remove_if_current(&second).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_wake_where_filters_users() {
        let registry = ConnectionRegistry::new();
        let sean = WakeSignal::new("sean");
        let alex = WakeSignal::new("alex");
        registry.install(sean.clone()).await;
        registry.install(alex.clone()).await;

        let woken = registry.wake_where(|user| user == "sean").await;
        assert_eq!(woken, 1);

        assert_eq!(sean.wait().await, Wake::Scan);
        assert!(timeout(Duration::from_millis(50), alex.wait()).await.is_err());
        assert_eq!(registry.users().await, vec!["alex".to_string(), "sean".to_string()]);
    }
}
