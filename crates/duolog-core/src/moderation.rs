//! Blocking, reports and administrative hooks.
//!
//! Side effects on the queue and on sessions (a ban ends the banned user's
//! chat) are orchestrated by the service; this module only owns profile
//! flags and the report log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use duolog_shared::models::{Report, Session, UserProfile};
use duolog_shared::repository::{Mutation, Repository};
use duolog_shared::types::{AnonId, ReportId, ReportStatus, UserId};

use crate::directory::UserDirectory;
use crate::error::{CoreError, PreconditionError, Result};

/// Reason recorded when the reporter gave none.
pub const DEFAULT_REPORT_REASON: &str = "inappropriate behavior";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnOutcome {
    pub warning_count: u32,
    pub threshold: u32,
    /// The warning pushed the user over the threshold.
    pub banned: bool,
}

/// Count one warning against `profile`; reaching `threshold` bans it. A
/// zero threshold never bans.
pub fn apply_warning(profile: &mut UserProfile, threshold: u32) -> WarnOutcome {
    profile.warning_count = profile.warning_count.saturating_add(1);
    if threshold > 0 && profile.warning_count >= threshold {
        profile.is_banned = true;
    }
    WarnOutcome {
        warning_count: profile.warning_count,
        threshold,
        banned: profile.is_banned,
    }
}

pub struct Moderation {
    directory: Arc<UserDirectory>,
    repo: Arc<dyn Repository>,
}

impl Moderation {
    pub fn new(directory: Arc<UserDirectory>, repo: Arc<dyn Repository>) -> Self {
        Self { directory, repo }
    }

    /// Add `target` to the initiator's block list. Returns whether the list
    /// changed; blocking twice, or blocking yourself, changes nothing.
    pub async fn block(&self, initiator: UserId, target: &AnonId) -> Result<bool> {
        let profile = self.directory.require(initiator).await?;
        if &profile.anon_id == target || profile.has_blocked(target) {
            return Ok(false);
        }
        if self.directory.find_by_anon(target).await.is_none() {
            return Err(PreconditionError::UnknownAnonId.into());
        }

        self.directory
            .update(initiator, |p| {
                p.blocked_anon_ids.insert(target.clone());
            })
            .await?;
        info!(user = %initiator, "Blocked a partner");
        Ok(true)
    }

    pub async fn blocked_list(&self, user_id: UserId) -> Result<Vec<AnonId>> {
        let profile = self.directory.require(user_id).await?;
        Ok(profile.blocked_anon_ids.into_iter().collect())
    }

    /// Build a report about the reporter's peer in `session`.
    pub fn draft_report(
        session: &Session,
        reporter: UserId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Report> {
        let (Some(me), Some(peer)) = (session.participant(reporter), session.peer_of(reporter))
        else {
            return Err(PreconditionError::NoActiveSession.into());
        };
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REPORT_REASON);

        Ok(Report {
            report_id: ReportId::generate(),
            reporter_anon_id: me.anon_id.clone(),
            reported_anon_id: peer.anon_id.clone(),
            session_id: session.session_id.clone(),
            reason: reason.to_string(),
            created_at: now,
            status: ReportStatus::Pending,
            admin_notes: None,
        })
    }

    pub async fn record_report(&self, report: &Report) -> Result<()> {
        self.repo.apply(&[Mutation::PutReport(report.clone())])?;
        info!(report = %report.report_id, session = %report.session_id, "Report recorded");
        Ok(())
    }

    pub async fn list_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>> {
        Ok(self.repo.load_reports(status)?)
    }

    pub async fn review_report(
        &self,
        report_id: &ReportId,
        admin_notes: Option<String>,
    ) -> Result<Report> {
        let mut report = self
            .repo
            .get_report(report_id)?
            .ok_or(CoreError::NotFound("Report"))?;
        report.status = ReportStatus::Reviewed;
        if admin_notes.is_some() {
            report.admin_notes = admin_notes;
        }
        self.repo.apply(&[Mutation::PutReport(report.clone())])?;
        info!(report = %report_id, "Report reviewed");
        Ok(report)
    }

    pub async fn unban(&self, user_id: UserId) -> Result<UserProfile> {
        let profile = self
            .directory
            .update(user_id, |p| p.is_banned = false)
            .await?;
        info!(user = %user_id, "User unbanned");
        Ok(profile)
    }

    /// `None` makes the user follow the global gate switch again.
    pub async fn set_monetize_override(
        &self,
        user_id: UserId,
        enabled: Option<bool>,
    ) -> Result<UserProfile> {
        let profile = self
            .directory
            .update(user_id, |p| p.monetize.enabled = enabled)
            .await?;
        info!(user = %user_id, ?enabled, "Gate override changed");
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::profile;
    use duolog_shared::{Gender, MemoryRepository, Preference};

    fn fixture() -> (Arc<UserDirectory>, Moderation) {
        let now = Utc::now();
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let directory = Arc::new(UserDirectory::with_users(
            repo.clone(),
            vec![
                profile(1, Gender::Male, Preference::Any, now),
                profile(2, Gender::Female, Preference::Any, now),
            ],
        ));
        (directory.clone(), Moderation::new(directory, repo))
    }

    #[tokio::test]
    async fn test_block_is_idempotent() {
        let (_, moderation) = fixture();
        let target = AnonId::new("u_00000002");

        assert!(moderation.block(UserId(1), &target).await.unwrap());
        assert!(!moderation.block(UserId(1), &target).await.unwrap());
        assert_eq!(moderation.blocked_list(UserId(1)).await.unwrap(), vec![target]);
    }

    #[tokio::test]
    async fn test_block_self_and_unknown() {
        let (_, moderation) = fixture();
        assert!(!moderation
            .block(UserId(1), &AnonId::new("u_00000001"))
            .await
            .unwrap());
        assert!(matches!(
            moderation.block(UserId(1), &AnonId::new("u_nobody00")).await,
            Err(CoreError::Precondition(PreconditionError::UnknownAnonId))
        ));
    }

    #[test]
    fn test_warn_threshold_bans() {
        let mut p = profile(2, Gender::Female, Preference::Any, Utc::now());
        let first = apply_warning(&mut p, 2);
        assert_eq!(first.warning_count, 1);
        assert!(!first.banned);

        let second = apply_warning(&mut p, 2);
        assert!(second.banned);
        assert!(p.is_banned);

        let mut lenient = profile(3, Gender::Male, Preference::Any, Utc::now());
        for _ in 0..5 {
            apply_warning(&mut lenient, 0);
        }
        assert!(!lenient.is_banned);
    }

    #[tokio::test]
    async fn test_unban() {
        let (directory, moderation) = fixture();
        directory
            .update(UserId(2), |p| p.is_banned = true)
            .await
            .unwrap();
        moderation.unban(UserId(2)).await.unwrap();
        assert!(!directory.get(UserId(2)).await.unwrap().is_banned);
    }

    #[tokio::test]
    async fn test_report_lifecycle() {
        let (directory, moderation) = fixture();
        let a = directory.get(UserId(1)).await.unwrap();
        let b = directory.get(UserId(2)).await.unwrap();
        let session = Session::new(a.participant(), b.participant(), Utc::now());

        let report = Moderation::draft_report(&session, UserId(1), Some("  "), Utc::now()).unwrap();
        assert_eq!(report.reason, DEFAULT_REPORT_REASON);
        assert_eq!(report.reported_anon_id, b.anon_id);
        moderation.record_report(&report).await.unwrap();

        let pending = moderation
            .list_reports(Some(ReportStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let reviewed = moderation
            .review_report(&report.report_id, Some("warned".into()))
            .await
            .unwrap();
        assert_eq!(reviewed.status, ReportStatus::Reviewed);
        assert!(moderation
            .list_reports(Some(ReportStatus::Pending))
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            moderation
                .review_report(&ReportId::new("report_missing"), None)
                .await,
            Err(CoreError::NotFound("Report"))
        ));
    }

    #[test]
    fn test_outsider_cannot_report() {
        let now = Utc::now();
        let a = profile(1, Gender::Male, Preference::Any, now);
        let b = profile(2, Gender::Female, Preference::Any, now);
        let session = Session::new(a.participant(), b.participant(), now);
        assert!(Moderation::draft_report(&session, UserId(3), None, now).is_err());
    }
}
