//! Logical entities owned by the core.
//!
//! Every struct derives `Serialize`/`Deserialize` so the server can hand it
//! to admin tooling as JSON and the store can round-trip it. A [`Session`]
//! refers to its participants by id only; the reverse lookup ("which session
//! is this user in") lives in the session store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AnonId, EndReason, Gender, Preference, ReportId, ReportStatus, SessionId, SessionStatus,
    TokenId, TokenStatus, UserId,
};

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

/// Per-user monetization gate bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonetizeState {
    /// Per-user override of the global switch. `None` follows the global
    /// default.
    pub enabled: Option<bool>,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// When set, always later than `last_completed_at`.
    pub next_due_at: Option<DateTime<Utc>>,
}

/// Everything the core knows about one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    /// Assigned once at registration and never changed.
    pub anon_id: AnonId,
    pub gender: Gender,
    pub preference: Preference,
    /// Consent to receive photos, documents and other files.
    pub allow_files: bool,
    pub blocked_anon_ids: BTreeSet<AnonId>,
    pub is_banned: bool,
    pub warning_count: u32,
    pub monetize: MonetizeState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl UserProfile {
    /// Build a fresh profile. The gate is due immediately so that the first
    /// search presents a challenge.
    pub fn new(
        user_id: UserId,
        anon_id: AnonId,
        gender: Gender,
        preference: Preference,
        allow_files: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            anon_id,
            gender,
            preference,
            allow_files,
            blocked_anon_ids: BTreeSet::new(),
            is_banned: false,
            warning_count: 0,
            monetize: MonetizeState {
                enabled: None,
                last_completed_at: None,
                next_due_at: Some(now),
            },
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn has_blocked(&self, anon_id: &AnonId) -> bool {
        self.blocked_anon_ids.contains(anon_id)
    }

    /// Identifier pair as stored inside a session.
    pub fn participant(&self) -> Participant {
        Participant {
            user_id: self.user_id,
            anon_id: self.anon_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Waiting queue
// ---------------------------------------------------------------------------

/// A user's standing request to be matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub gender: Gender,
    pub preference: Preference,
    pub enqueued_at: DateTime<Utc>,
    /// Strictly increasing per queue; breaks `enqueued_at` ties and lets the
    /// matcher detect that an entry was replaced between snapshot and pairing.
    pub ticket: u64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Participant {
    pub user_id: UserId,
    pub anon_id: AnonId,
}

/// One pairing between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub participant_a: Participant,
    pub participant_b: Participant,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub end_reason: Option<EndReason>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` when the system ended the session (timeout, ban, delivery
    /// failure).
    pub ended_by: Option<UserId>,
    pub message_count: u64,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(a: Participant, b: Participant, now: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::generate(),
            participant_a: a,
            participant_b: b,
            started_at: now,
            status: SessionStatus::Active,
            end_reason: None,
            ended_at: None,
            ended_by: None,
            message_count: 0,
            last_activity_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.participant_a.user_id == user_id || self.participant_b.user_id == user_id
    }

    /// The other participant, or `None` if `user_id` is not part of this
    /// session.
    pub fn peer_of(&self, user_id: UserId) -> Option<&Participant> {
        if self.participant_a.user_id == user_id {
            Some(&self.participant_b)
        } else if self.participant_b.user_id == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        if self.participant_a.user_id == user_id {
            Some(&self.participant_a)
        } else if self.participant_b.user_id == user_id {
            Some(&self.participant_b)
        } else {
            None
        }
    }

    pub fn user_ids(&self) -> [UserId; 2] {
        [self.participant_a.user_id, self.participant_b.user_id]
    }
}

// ---------------------------------------------------------------------------
// Gate token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonetizeToken {
    pub token: TokenId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
    /// External link the user is asked to visit.
    pub link: String,
}

impl MonetizeToken {
    pub fn is_pending(&self) -> bool {
        self.status == TokenStatus::Pending
    }

    pub fn is_past_ttl(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Moderation report. Append-only apart from the review fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub report_id: ReportId,
    pub reporter_anon_id: AnonId,
    pub reported_anon_id: AnonId,
    pub session_id: SessionId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub admin_notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: i64, anon: &str) -> Participant {
        Participant {
            user_id: UserId(id),
            anon_id: AnonId::new(anon),
        }
    }

    #[test]
    fn test_new_profile_is_due_immediately() {
        let now = Utc::now();
        let profile = UserProfile::new(
            UserId(1),
            AnonId::new("u_aaaaaaaa"),
            Gender::Male,
            Preference::Any,
            false,
            now,
        );
        assert_eq!(profile.monetize.next_due_at, Some(now));
        assert!(profile.monetize.last_completed_at.is_none());
        assert!(!profile.is_banned);
    }

    #[test]
    fn test_session_peer_lookup() {
        let session = Session::new(participant(1, "u_a"), participant(2, "u_b"), Utc::now());
        assert!(session.is_active());
        assert_eq!(session.peer_of(UserId(1)).unwrap().user_id, UserId(2));
        assert_eq!(session.peer_of(UserId(2)).unwrap().user_id, UserId(1));
        assert!(session.peer_of(UserId(3)).is_none());
        assert!(session.involves(UserId(2)));
        assert!(!session.involves(UserId(3)));
    }
}
