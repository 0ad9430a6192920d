//! Waiting queue.
//!
//! Entries are ordered by `enqueued_at`, ties broken by a strictly
//! increasing ticket. A user appears at most once. Matching works on an
//! immutable [`QueueSnapshot`]; the pairing step re-validates both entries
//! under [`WaitingQueue::lock`] before removing them, so concurrent
//! enqueue/dequeue never corrupts a pass.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use duolog_shared::models::{QueueEntry, UserProfile};
use duolog_shared::types::UserId;

use crate::error::PreconditionError;

#[derive(Default)]
pub struct QueueState {
    entries: HashMap<UserId, QueueEntry>,
    next_ticket: u64,
}

impl QueueState {
    /// Whether this exact entry (same ticket) is still waiting.
    pub fn is_live(&self, entry: &QueueEntry) -> bool {
        self.entries
            .get(&entry.user_id)
            .is_some_and(|current| current.ticket == entry.ticket)
    }

    pub fn remove(&mut self, user_id: UserId) -> Option<QueueEntry> {
        self.entries.remove(&user_id)
    }

    /// Remove both entries only if both are still live under the same
    /// tickets. Either both leave the queue or neither does.
    pub fn take_pair(&mut self, a: &QueueEntry, b: &QueueEntry) -> bool {
        if a.user_id == b.user_id || !self.is_live(a) || !self.is_live(b) {
            return false;
        }
        self.entries.remove(&a.user_id);
        self.entries.remove(&b.user_id);
        true
    }
}

/// Exclusive access to the queue for a compare-and-remove step.
pub type QueueLock<'a> = MutexGuard<'a, QueueState>;

pub struct WaitingQueue {
    state: Mutex<QueueState>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Add the user with their current gender and preference.
    pub async fn enqueue(
        &self,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, PreconditionError> {
        if profile.is_banned {
            return Err(PreconditionError::Banned);
        }

        let mut state = self.state.lock().await;
        if state.entries.contains_key(&profile.user_id) {
            return Err(PreconditionError::AlreadyQueued);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let entry = QueueEntry {
            user_id: profile.user_id,
            gender: profile.gender,
            preference: profile.preference,
            enqueued_at: now,
            ticket,
        };
        state.entries.insert(profile.user_id, entry.clone());

        debug!(user = %profile.user_id, ticket, waiting = state.entries.len(), "Enqueued");
        Ok(entry)
    }

    /// Remove the user if present. Idempotent.
    pub async fn dequeue(&self, user_id: UserId) -> Option<QueueEntry> {
        let removed = self.state.lock().await.remove(user_id);
        if removed.is_some() {
            debug!(user = %user_id, "Dequeued");
        }
        removed
    }

    /// Put a removed entry back with its original time and ticket, so the
    /// user keeps their place. No-op if the user is queued again already.
    pub async fn restore(&self, entry: QueueEntry) -> bool {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&entry.user_id) {
            return false;
        }
        debug!(user = %entry.user_id, ticket = entry.ticket, "Queue entry restored");
        state.entries.insert(entry.user_id, entry);
        true
    }

    /// Refresh gender and preference of a waiting user, keeping their place.
    pub async fn refresh(&self, profile: &UserProfile) -> bool {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&profile.user_id) {
            Some(entry) => {
                entry.gender = profile.gender;
                entry.preference = profile.preference;
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, user_id: UserId) -> bool {
        self.state.lock().await.entries.contains_key(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy the current entries in queue order.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let mut entries: Vec<QueueEntry> =
            self.state.lock().await.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then(a.ticket.cmp(&b.ticket))
        });
        QueueSnapshot {
            entries: entries.into(),
        }
    }

    pub async fn take_pair(&self, a: &QueueEntry, b: &QueueEntry) -> bool {
        self.state.lock().await.take_pair(a, b)
    }

    pub async fn lock(&self) -> QueueLock<'_> {
        self.state.lock().await
    }
}

impl Default for WaitingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the queue. Iterating it is lazy, cheap to clone,
/// and can be restarted any number of times.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    entries: Arc<[QueueEntry]>,
}

impl QueueSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, QueueEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[QueueEntry] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a QueueSnapshot {
    type Item = &'a QueueEntry;
    type IntoIter = std::slice::Iter<'a, QueueEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
