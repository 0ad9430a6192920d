//! Session store.
//!
//! Owns every session and the reverse index from user to active session.
//! [`SessionStore::end`] is a compare-and-set on the session status: of any
//! number of concurrent terminal requests exactly one observes
//! [`Termination::Ended`], the rest observe [`Termination::AlreadyEnded`]
//! carrying the winner's reason.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use duolog_shared::models::{Participant, Session};
use duolog_shared::repository::{Mutation, Repository};
use duolog_shared::types::{EndReason, SessionId, SessionStatus, UserId};

use crate::error::{CoreError, Result};

/// Result of a terminal request against a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// This request performed the transition.
    Ended(Session),
    /// Another request got there first.
    AlreadyEnded(Session),
}

impl Termination {
    pub fn session(&self) -> &Session {
        match self {
            Termination::Ended(s) | Termination::AlreadyEnded(s) => s,
        }
    }

    pub fn is_winner(&self) -> bool {
        matches!(self, Termination::Ended(_))
    }
}

#[derive(Default)]
struct SessionState {
    sessions: HashMap<SessionId, Session>,
    active_by_user: HashMap<UserId, SessionId>,
    /// Most recent session per user, active or not. Ended sessions are kept
    /// only while one of their participants still points at them here.
    last_by_user: HashMap<UserId, SessionId>,
}

impl SessionState {
    fn insert_active(&mut self, session: Session) {
        for user_id in session.user_ids() {
            self.active_by_user.insert(user_id, session.session_id.clone());
            if let Some(previous) = self.last_by_user.insert(user_id, session.session_id.clone())
            {
                self.forget_if_unreferenced(&previous);
            }
        }
        self.sessions.insert(session.session_id.clone(), session);
    }

    fn forget_if_unreferenced(&mut self, session_id: &SessionId) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if session.is_active() {
            return;
        }
        let referenced = session
            .user_ids()
            .iter()
            .any(|u| self.last_by_user.get(u) == Some(session_id));
        if !referenced {
            self.sessions.remove(session_id);
        }
    }

    fn active_for(&self, user_id: UserId) -> Option<&Session> {
        self.active_by_user
            .get(&user_id)
            .and_then(|id| self.sessions.get(id))
    }
}

pub struct SessionStore {
    state: Mutex<SessionState>,
    repo: Arc<dyn Repository>,
}

impl SessionStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self::with_sessions(repo, Vec::new())
    }

    /// Rebuild from persisted active sessions. A user found in more than one
    /// keeps only the most recently started.
    pub fn with_sessions(repo: Arc<dyn Repository>, mut sessions: Vec<Session>) -> Self {
        sessions.sort_by_key(|s| s.started_at);
        let mut state = SessionState::default();
        for session in sessions.into_iter().rev() {
            if !session.is_active() {
                continue;
            }
            if session
                .user_ids()
                .iter()
                .any(|u| state.active_by_user.contains_key(u))
            {
                warn!(session = %session.session_id, "Skipping overlapping session on restore");
                continue;
            }
            state.insert_active(session);
        }
        Self {
            state: Mutex::new(state),
            repo,
        }
    }

    /// Open a session between two users. Returns `None` without side effects
    /// when either is already in an active session.
    pub async fn create(
        &self,
        a: Participant,
        b: Participant,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        if a.user_id == b.user_id {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        if state.active_by_user.contains_key(&a.user_id)
            || state.active_by_user.contains_key(&b.user_id)
        {
            return Ok(None);
        }

        let session = Session::new(a, b, now);
        self.repo.apply(&[Mutation::PutSession(session.clone())])?;
        state.insert_active(session.clone());

        info!(
            session = %session.session_id,
            active = state.active_by_user.len() / 2,
            "Session started"
        );
        Ok(Some(session))
    }

    pub async fn active_for(&self, user_id: UserId) -> Option<Session> {
        self.state.lock().await.active_for(user_id).cloned()
    }

    pub async fn find_active_for(&self, user_id: UserId) -> Result<Session> {
        self.active_for(user_id)
            .await
            .ok_or(CoreError::NotFound("Session"))
    }

    pub async fn is_in_session(&self, user_id: UserId) -> bool {
        self.state.lock().await.active_by_user.contains_key(&user_id)
    }

    /// The user's most recent session, active or ended.
    pub async fn last_for(&self, user_id: UserId) -> Option<Session> {
        let state = self.state.lock().await;
        state
            .last_by_user
            .get(&user_id)
            .and_then(|id| state.sessions.get(id))
            .cloned()
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    /// Move `session_id` to `ended`, persisting `extra` in the same batch.
    /// `extra` is dropped when the session had already ended.
    pub async fn end(
        &self,
        session_id: &SessionId,
        reason: EndReason,
        ended_by: Option<UserId>,
        now: DateTime<Utc>,
        extra: Vec<Mutation>,
    ) -> Result<Termination> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or(CoreError::NotFound("Session"))?;
        self.end_locked(&mut state, session, reason, ended_by, now, extra)
    }

    /// End whatever session `user_id` is in. With no active session, reports
    /// the user's last session as already ended, or `None` if there never
    /// was one.
    pub async fn end_for_user(
        &self,
        user_id: UserId,
        reason: EndReason,
        ended_by: Option<UserId>,
        now: DateTime<Utc>,
        extra: Vec<Mutation>,
    ) -> Result<Option<Termination>> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.active_for(user_id).cloned() {
            return self
                .end_locked(&mut state, session, reason, ended_by, now, extra)
                .map(Some);
        }
        Ok(state
            .last_by_user
            .get(&user_id)
            .and_then(|id| state.sessions.get(id))
            .cloned()
            .map(Termination::AlreadyEnded))
    }

    /// End `session_id` with `disconnect` only if it is still active and
    /// has seen no traffic for longer than `timeout`.
    pub async fn end_if_idle(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Option<Termination>> {
        let mut state = self.state.lock().await;
        let Some(session) = state
            .sessions
            .get(session_id)
            .filter(|s| s.is_active() && now - s.last_activity_at > timeout)
            .cloned()
        else {
            return Ok(None);
        };
        self.end_locked(&mut state, session, EndReason::Disconnect, None, now, Vec::new())
            .map(Some)
    }

    fn end_locked(
        &self,
        state: &mut SessionState,
        session: Session,
        reason: EndReason,
        ended_by: Option<UserId>,
        now: DateTime<Utc>,
        extra: Vec<Mutation>,
    ) -> Result<Termination> {
        if !session.is_active() {
            debug!(session = %session.session_id, "Session already ended");
            return Ok(Termination::AlreadyEnded(session));
        }

        let mut ended = session;
        ended.status = SessionStatus::Ended;
        ended.end_reason = Some(reason);
        ended.ended_at = Some(now);
        ended.ended_by = ended_by;

        let mut batch = Vec::with_capacity(1 + extra.len());
        batch.push(Mutation::PutSession(ended.clone()));
        batch.extend(extra);
        self.repo.apply(&batch)?;

        for user_id in ended.user_ids() {
            if state.active_by_user.get(&user_id) == Some(&ended.session_id) {
                state.active_by_user.remove(&user_id);
            }
        }
        state
            .sessions
            .insert(ended.session_id.clone(), ended.clone());

        info!(
            session = %ended.session_id,
            reason = %reason,
            messages = ended.message_count,
            "Session ended"
        );
        Ok(Termination::Ended(ended))
    }

    /// Count one relayed message. Returns the new count, or `None` if the
    /// session is no longer active.
    pub async fn record_message(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get(session_id).filter(|s| s.is_active()) else {
            return Ok(None);
        };

        let mut updated = session.clone();
        updated.message_count += 1;
        updated.last_activity_at = now;
        self.repo.apply(&[Mutation::PutSession(updated.clone())])?;

        let count = updated.message_count;
        state.sessions.insert(session_id.clone(), updated);
        Ok(Some(count))
    }

    /// Active sessions without traffic for longer than `timeout`.
    pub async fn idle(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Session> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.is_active() && now - s.last_activity_at > timeout)
            .cloned()
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.is_active())
            .count()
    }
}
