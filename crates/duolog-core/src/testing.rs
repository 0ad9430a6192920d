//! Test doubles shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use duolog_shared::{
    MemoryRepository, MonetizeToken, Mutation, Report, ReportId, ReportStatus, Repository,
    RepositoryError, Session, UserProfile,
};

/// A memory repository whose writes can be switched off.
#[derive(Default)]
pub struct FlakyRepository {
    inner: MemoryRepository,
    failing: AtomicBool,
    failing_reports: AtomicBool,
    write_delay_micros: AtomicU64,
}

impl FlakyRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every write block for `delay`, widening race windows.
    pub fn set_write_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.write_delay_micros.store(micros, Ordering::SeqCst);
    }

    /// Fail only batches that contain a report.
    pub fn set_failing_reports(&self, failing: bool) {
        self.failing_reports.store(failing, Ordering::SeqCst);
    }
}

impl Repository for FlakyRepository {
    fn apply(&self, batch: &[Mutation]) -> Result<(), RepositoryError> {
        let delay = self.write_delay_micros.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("injected failure".into()));
        }
        if self.failing_reports.load(Ordering::SeqCst)
            && batch.iter().any(|m| matches!(m, Mutation::PutReport(_)))
        {
            return Err(RepositoryError::Unavailable("injected report failure".into()));
        }
        self.inner.apply(batch)
    }

    fn load_users(&self) -> Result<Vec<UserProfile>, RepositoryError> {
        self.inner.load_users()
    }

    fn load_active_sessions(&self) -> Result<Vec<Session>, RepositoryError> {
        self.inner.load_active_sessions()
    }

    fn load_pending_tokens(&self) -> Result<Vec<MonetizeToken>, RepositoryError> {
        self.inner.load_pending_tokens()
    }

    fn load_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>, RepositoryError> {
        self.inner.load_reports(status)
    }

    fn get_report(&self, report_id: &ReportId) -> Result<Option<Report>, RepositoryError> {
        self.inner.get_report(report_id)
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

pub fn profile(
    id: i64,
    gender: duolog_shared::Gender,
    preference: duolog_shared::Preference,
    now: DateTime<Utc>,
) -> UserProfile {
    UserProfile::new(
        duolog_shared::UserId(id),
        duolog_shared::AnonId::new(format!("u_{id:08}")),
        gender,
        preference,
        true,
        now,
    )
}
