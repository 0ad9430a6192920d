//! [`Repository`] implementation over a single SQLite connection.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use duolog_shared::{
    MonetizeToken, Mutation, Report, ReportId, ReportStatus, Repository, RepositoryError, Session,
    UserProfile,
};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::{reports, sessions, tokens, users};

/// SQLite-backed repository. Every [`Repository::apply`] batch runs in one
/// transaction.
pub struct SqliteRepository {
    db: Mutex<Database>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Open (or create) the database file at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn apply_batch(&self, batch: &[Mutation]) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.conn_mut().transaction()?;
        for mutation in batch {
            match mutation {
                Mutation::PutUser(user) => users::upsert_user(&tx, user)?,
                Mutation::PutSession(session) => sessions::upsert_session(&tx, session)?,
                Mutation::PutToken(token) => tokens::upsert_token(&tx, token)?,
                Mutation::PutReport(report) => reports::upsert_report(&tx, report)?,
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl Repository for SqliteRepository {
    fn apply(&self, batch: &[Mutation]) -> std::result::Result<(), RepositoryError> {
        match self.apply_batch(batch) {
            Ok(()) => {
                debug!(mutations = batch.len(), "Committed batch");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, mutations = batch.len(), "Batch rolled back");
                Err(e.into())
            }
        }
    }

    fn load_users(&self) -> std::result::Result<Vec<UserProfile>, RepositoryError> {
        let db = self.lock()?;
        Ok(users::load_users(db.conn())?)
    }

    fn load_active_sessions(&self) -> std::result::Result<Vec<Session>, RepositoryError> {
        let db = self.lock()?;
        Ok(sessions::load_active_sessions(db.conn())?)
    }

    fn load_pending_tokens(&self) -> std::result::Result<Vec<MonetizeToken>, RepositoryError> {
        let db = self.lock()?;
        Ok(tokens::load_pending_tokens(db.conn())?)
    }

    fn load_reports(
        &self,
        status: Option<ReportStatus>,
    ) -> std::result::Result<Vec<Report>, RepositoryError> {
        let db = self.lock()?;
        Ok(reports::load_reports(db.conn(), status)?)
    }

    fn get_report(
        &self,
        report_id: &ReportId,
    ) -> std::result::Result<Option<Report>, RepositoryError> {
        let db = self.lock()?;
        Ok(reports::get_report(db.conn(), report_id)?)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use duolog_shared::{AnonId, Gender, Preference, UserId};

    fn profile(id: i64, anon: &str) -> UserProfile {
        UserProfile::new(
            UserId(id),
            AnonId::new(anon),
            Gender::Male,
            Preference::Any,
            false,
            Utc::now(),
        )
    }

    #[test]
    fn failed_batch_leaves_no_partial_state() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.apply(&[Mutation::PutUser(profile(1, "u_same"))]).unwrap();

        // Second user reuses the unique anon id, so the whole batch fails and
        // the first mutation in it must be rolled back too.
        let session = Session::new(
            profile(1, "u_same").participant(),
            profile(2, "u_other").participant(),
            Utc::now(),
        );
        let result = repo.apply(&[
            Mutation::PutSession(session),
            Mutation::PutUser(profile(3, "u_same")),
        ]);

        assert!(matches!(result, Err(RepositoryError::Unavailable(_))));
        assert!(repo.load_active_sessions().unwrap().is_empty());
        assert_eq!(repo.load_users().unwrap().len(), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duolog.db");
        let user = profile(9, "u_nine9999");

        {
            let repo = SqliteRepository::open_at(&path).unwrap();
            repo.apply(&[Mutation::PutUser(user.clone())]).unwrap();
        }

        let repo = SqliteRepository::open_at(&path).unwrap();
        assert_eq!(repo.load_users().unwrap(), vec![user]);
        assert_eq!(repo.name(), "sqlite");
    }
}
