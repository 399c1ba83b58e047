//! Per-user chat status and the broker-wide status snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Idling,
    Queueing,
    Asking,
}

/// Which users have an ask in flight. A user holds at most one.
#[derive(Default)]
pub struct UserStatuses {
    inner: Mutex<HashMap<UserId, ChatStatus>>,
}

/// Marks a user busy until dropped.
pub struct StatusGuard {
    registry: Arc<UserStatuses>,
    user: UserId,
}

impl UserStatuses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the user for a new ask; `None` when one is already in flight.
    pub fn try_begin(self: &Arc<Self>, user: UserId) -> Option<StatusGuard> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&user) {
            return None;
        }
        inner.insert(user, ChatStatus::Queueing);
        Some(StatusGuard {
            registry: Arc::clone(self),
            user,
        })
    }

    pub fn get(&self, user: UserId) -> ChatStatus {
        self.inner
            .lock()
            .get(&user)
            .copied()
            .unwrap_or(ChatStatus::Idling)
    }

    /// (queueing, asking) user counts.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let queueing = inner
            .values()
            .filter(|s| **s == ChatStatus::Queueing)
            .count();
        (queueing, inner.len() - queueing)
    }
}

impl StatusGuard {
    pub fn set(&self, status: ChatStatus) {
        self.registry.inner.lock().insert(self.user, status);
    }
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.registry.inner.lock().remove(&self.user);
    }
}

/// What `GET /status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub browser_session_busy: bool,
    pub queue_depth: usize,
    pub queueing_users: usize,
    pub asking_users: usize,
    pub asks_in_window: u64,
    pub requests_in_window: u64,
}
