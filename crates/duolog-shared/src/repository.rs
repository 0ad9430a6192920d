//! Durable storage seam.
//!
//! The core writes through a [`Repository`] before committing any state
//! change in memory. A batch passed to [`Repository::apply`] is
//! all-or-nothing, which is what makes multi-entity transitions (pairing,
//! gate completion, block + end) safe against a failing backend.
//!
//! - **MemoryRepository**: in-process map store (tests, ephemeral deployments)
//! - `duolog-store` provides the SQLite implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::error::RepositoryError;
use crate::models::{MonetizeToken, Report, Session, UserProfile};
use crate::types::{ReportId, ReportStatus, SessionId, TokenId, UserId};

/// A single keyed upsert.
#[derive(Debug, Clone)]
pub enum Mutation {
    PutUser(UserProfile),
    PutSession(Session),
    PutToken(MonetizeToken),
    PutReport(Report),
}

/// Storage backend for profiles, sessions, gate tokens and reports.
pub trait Repository: Send + Sync {
    /// Apply every mutation or none of them.
    fn apply(&self, batch: &[Mutation]) -> Result<(), RepositoryError>;

    fn load_users(&self) -> Result<Vec<UserProfile>, RepositoryError>;

    fn load_active_sessions(&self) -> Result<Vec<Session>, RepositoryError>;

    fn load_pending_tokens(&self) -> Result<Vec<MonetizeToken>, RepositoryError>;

    /// Reports ordered by creation time, optionally filtered by status.
    fn load_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>, RepositoryError>;

    fn get_report(&self, report_id: &ReportId) -> Result<Option<Report>, RepositoryError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Default)]
struct MemoryData {
    users: HashMap<UserId, UserProfile>,
    sessions: HashMap<SessionId, Session>,
    tokens: HashMap<TokenId, MonetizeToken>,
    reports: HashMap<ReportId, Report>,
}

/// In-memory repository. One mutex guards all maps, so a batch is atomic.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    data: Mutex<MemoryData>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryData>, RepositoryError> {
        self.data
            .lock()
            .map_err(|_| RepositoryError::Unavailable("memory repository poisoned".into()))
    }
}

impl Repository for MemoryRepository {
    fn apply(&self, batch: &[Mutation]) -> Result<(), RepositoryError> {
        let mut data = self.lock()?;
        for mutation in batch {
            match mutation {
                Mutation::PutUser(user) => {
                    data.users.insert(user.user_id, user.clone());
                }
                Mutation::PutSession(session) => {
                    data.sessions
                        .insert(session.session_id.clone(), session.clone());
                }
                Mutation::PutToken(token) => {
                    data.tokens.insert(token.token, token.clone());
                }
                Mutation::PutReport(report) => {
                    data.reports
                        .insert(report.report_id.clone(), report.clone());
                }
            }
        }
        trace!(mutations = batch.len(), "Applied batch to memory repository");
        Ok(())
    }

    fn load_users(&self) -> Result<Vec<UserProfile>, RepositoryError> {
        Ok(self.lock()?.users.values().cloned().collect())
    }

    fn load_active_sessions(&self) -> Result<Vec<Session>, RepositoryError> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }

    fn load_pending_tokens(&self) -> Result<Vec<MonetizeToken>, RepositoryError> {
        Ok(self
            .lock()?
            .tokens
            .values()
            .filter(|t| t.is_pending())
            .cloned()
            .collect())
    }

    fn load_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>, RepositoryError> {
        let data = self.lock()?;
        let mut reports: Vec<Report> = data
            .reports
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.created_at);
        Ok(reports)
    }

    fn get_report(&self, report_id: &ReportId) -> Result<Option<Report>, RepositoryError> {
        Ok(self.lock()?.reports.get(report_id).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Participant;
    use crate::types::{AnonId, Gender, Preference, SessionStatus};
    use chrono::Utc;

    fn user(id: i64) -> UserProfile {
        UserProfile::new(
            UserId(id),
            AnonId::new(format!("u_{id:08}")),
            Gender::Female,
            Preference::Any,
            true,
            Utc::now(),
        )
    }

    #[test]
    fn test_apply_and_load() {
        let repo = MemoryRepository::new();
        let a = user(1);
        let b = user(2);
        let mut ended = Session::new(a.participant(), b.participant(), Utc::now());
        ended.status = SessionStatus::Ended;
        let active = Session::new(
            Participant {
                user_id: UserId(3),
                anon_id: AnonId::new("u_c"),
            },
            a.participant(),
            Utc::now(),
        );

        repo.apply(&[
            Mutation::PutUser(a),
            Mutation::PutUser(b),
            Mutation::PutSession(ended),
            Mutation::PutSession(active.clone()),
        ])
        .unwrap();

        assert_eq!(repo.load_users().unwrap().len(), 2);
        assert_eq!(repo.load_active_sessions().unwrap(), vec![active]);
    }

    #[test]
    fn test_put_is_upsert() {
        let repo = MemoryRepository::new();
        let mut a = user(1);
        repo.apply(&[Mutation::PutUser(a.clone())]).unwrap();
        a.is_banned = true;
        repo.apply(&[Mutation::PutUser(a)]).unwrap();

        let users = repo.load_users().unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].is_banned);
    }
}
