//! Pairing rules and the matching pass.
//!
//! A pass walks a queue snapshot in order. For each still-unmatched entry it
//! pairs with the first later entry that is mutually compatible and not
//! blocked either way. Pairing re-checks both entries under the queue lock,
//! creates the session, and only then removes both entries, so a user who
//! cancels or gets paired elsewhere mid-pass is never matched twice.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use duolog_shared::models::{QueueEntry, Session, UserProfile};
use duolog_shared::types::{Gender, Preference, UserId};

use crate::directory::UserDirectory;
use crate::error::Result;
use crate::queue::WaitingQueue;
use crate::session::SessionStore;

/// Whether someone of gender `own` with `preference` accepts a partner of
/// gender `peer`.
pub fn accepts(preference: Preference, own: Gender, peer: Gender) -> bool {
    match preference {
        Preference::Any => true,
        Preference::Same => own == peer,
        Preference::Opposite => matches!(
            (own, peer),
            (Gender::Male, Gender::Female) | (Gender::Female, Gender::Male)
        ),
        Preference::Other => peer == Gender::Other,
    }
}

/// Preferences must be satisfied in both directions.
pub fn is_compatible(x: &QueueEntry, y: &QueueEntry) -> bool {
    accepts(x.preference, x.gender, y.gender) && accepts(y.preference, y.gender, x.gender)
}

/// Neither user has blocked the other.
pub fn not_blocked(x: &UserProfile, y: &UserProfile) -> bool {
    !x.has_blocked(&y.anon_id) && !y.has_blocked(&x.anon_id)
}

enum PairAttempt {
    Paired(Session),
    /// At least one entry changed since the snapshot.
    Stale { x_live: bool },
}

pub struct Matcher {
    queue: Arc<WaitingQueue>,
    sessions: Arc<SessionStore>,
    directory: Arc<UserDirectory>,
}

impl Matcher {
    pub fn new(
        queue: Arc<WaitingQueue>,
        sessions: Arc<SessionStore>,
        directory: Arc<UserDirectory>,
    ) -> Self {
        Self {
            queue,
            sessions,
            directory,
        }
    }

    /// Run one pass and return the sessions it opened. Storage failures stop
    /// the pass early; the affected users stay queued for the next one.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Vec<Session> {
        let snapshot = self.queue.snapshot().await;
        let entries = snapshot.as_slice();
        let mut matched: HashSet<UserId> = HashSet::new();
        let mut created = Vec::new();

        'outer: for (i, x) in entries.iter().enumerate() {
            if matched.contains(&x.user_id) {
                continue;
            }
            let Some(x_profile) = self.eligible(x.user_id).await else {
                continue;
            };

            for y in &entries[i + 1..] {
                if matched.contains(&y.user_id) || !is_compatible(x, y) {
                    continue;
                }
                let Some(y_profile) = self.eligible(y.user_id).await else {
                    continue;
                };
                if !not_blocked(&x_profile, &y_profile) {
                    continue;
                }

                match self.try_pair(x, y, now).await {
                    Ok(PairAttempt::Paired(session)) => {
                        matched.insert(x.user_id);
                        matched.insert(y.user_id);
                        created.push(session);
                        break;
                    }
                    Ok(PairAttempt::Stale { x_live: false }) => break,
                    Ok(PairAttempt::Stale { x_live: true }) => continue,
                    Err(e) => {
                        warn!(error = %e, "Matching pass aborted");
                        break 'outer;
                    }
                }
            }
        }

        if !created.is_empty() {
            debug!(
                pairs = created.len(),
                scanned = entries.len(),
                "Matching pass finished"
            );
        }
        created
    }

    async fn eligible(&self, user_id: UserId) -> Option<UserProfile> {
        self.directory
            .get(user_id)
            .await
            .filter(|profile| !profile.is_banned)
    }

    async fn try_pair(
        &self,
        x: &QueueEntry,
        y: &QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<PairAttempt> {
        let mut queue = self.queue.lock().await;
        let x_live = queue.is_live(x);
        if !x_live || !queue.is_live(y) {
            return Ok(PairAttempt::Stale { x_live });
        }

        // Bans and blocks may have landed since the pass read the profiles.
        let Some(x_profile) = self.eligible(x.user_id).await else {
            return Ok(PairAttempt::Stale { x_live: false });
        };
        let Some(y_profile) = self.eligible(y.user_id).await else {
            return Ok(PairAttempt::Stale { x_live: true });
        };
        if !not_blocked(&x_profile, &y_profile) {
            debug!(x = %x.user_id, y = %y.user_id, "Blocked since snapshot, not pairing");
            return Ok(PairAttempt::Stale { x_live: true });
        }

        match self
            .sessions
            .create(x_profile.participant(), y_profile.participant(), now)
            .await?
        {
            Some(session) => {
                queue.take_pair(x, y);
                Ok(PairAttempt::Paired(session))
            }
            None => {
                // Someone is already chatting; their entry is stale.
                let mut x_live = true;
                for entry in [x, y] {
                    if self.sessions.is_in_session(entry.user_id).await {
                        queue.remove(entry.user_id);
                        x_live &= entry.user_id != x.user_id;
                    }
                }
                Ok(PairAttempt::Stale { x_live })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Registration;
    use duolog_shared::MemoryRepository;

    fn entry(id: i64, gender: Gender, preference: Preference) -> QueueEntry {
        QueueEntry {
            user_id: UserId(id),
            gender,
            preference,
            enqueued_at: Utc::now(),
            ticket: id as u64,
        }
    }

    #[test]
    fn test_preference_rules() {
        use Gender::*;
        assert!(accepts(Preference::Any, Male, Other));
        assert!(accepts(Preference::Same, Female, Female));
        assert!(!accepts(Preference::Same, Female, Male));
        assert!(accepts(Preference::Opposite, Male, Female));
        assert!(!accepts(Preference::Opposite, Male, Other));
        assert!(!accepts(Preference::Opposite, Other, Female));
        assert!(accepts(Preference::Other, Male, Other));
        assert!(!accepts(Preference::Other, Male, Female));
    }

    #[test]
    fn test_compatibility_is_mutual() {
        let a = entry(1, Gender::Male, Preference::Opposite);
        let b = entry(2, Gender::Female, Preference::Opposite);
        let c = entry(3, Gender::Female, Preference::Same);
        assert!(is_compatible(&a, &b));
        assert!(is_compatible(&b, &a));
        assert!(!is_compatible(&a, &c));
        assert!(!is_compatible(&c, &a));
    }

    struct Fixture {
        queue: Arc<WaitingQueue>,
        sessions: Arc<SessionStore>,
        directory: Arc<UserDirectory>,
        matcher: Matcher,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(WaitingQueue::new());
        let sessions = Arc::new(SessionStore::new(repo.clone()));
        let directory = Arc::new(UserDirectory::new(repo));
        let matcher = Matcher::new(queue.clone(), sessions.clone(), directory.clone());
        Fixture {
            queue,
            sessions,
            directory,
            matcher,
        }
    }

    async fn join(f: &Fixture, id: i64, gender: Gender, preference: Preference) -> UserProfile {
        let profile = f
            .directory
            .register(
                UserId(id),
                &Registration {
                    gender,
                    preference,
                    allow_files: false,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        f.queue.enqueue(&profile, Utc::now()).await.unwrap();
        profile
    }

    #[tokio::test]
    async fn test_first_fit_respects_queue_order() {
        let f = fixture();
        join(&f, 1, Gender::Male, Preference::Any).await;
        join(&f, 2, Gender::Male, Preference::Opposite).await;
        join(&f, 3, Gender::Female, Preference::Any).await;
        join(&f, 4, Gender::Female, Preference::Any).await;

        let created = f.matcher.run_pass(Utc::now()).await;
        assert_eq!(created.len(), 2);
        // 2 refuses males, so 1 takes 3 and 2 falls through to 4.
        assert!(created[0].involves(UserId(1)) && created[0].involves(UserId(3)));
        assert!(created[1].involves(UserId(2)) && created[1].involves(UserId(4)));
        assert!(f.queue.is_empty().await);
        assert!(f.sessions.is_in_session(UserId(2)).await);
    }

    #[tokio::test]
    async fn test_blocked_users_never_paired() {
        let f = fixture();
        let a = join(&f, 1, Gender::Male, Preference::Any).await;
        let b = join(&f, 2, Gender::Female, Preference::Any).await;
        f.directory
            .update(b.user_id, |p| {
                p.blocked_anon_ids.insert(a.anon_id.clone());
            })
            .await
            .unwrap();

        assert!(f.matcher.run_pass(Utc::now()).await.is_empty());
        assert_eq!(f.queue.len().await, 2);

        join(&f, 3, Gender::Other, Preference::Any).await;
        let created = f.matcher.run_pass(Utc::now()).await;
        assert_eq!(created.len(), 1);
        assert!(created[0].involves(UserId(1)) && created[0].involves(UserId(3)));
        assert!(f.queue.contains(UserId(2)).await);
    }

    #[tokio::test]
    async fn test_opposite_with_other_gender_waits() {
        let f = fixture();
        join(&f, 1, Gender::Other, Preference::Opposite).await;
        join(&f, 2, Gender::Male, Preference::Any).await;
        join(&f, 3, Gender::Female, Preference::Any).await;

        let created = f.matcher.run_pass(Utc::now()).await;
        assert_eq!(created.len(), 1);
        assert!(created[0].involves(UserId(2)) && created[0].involves(UserId(3)));
        assert!(f.queue.contains(UserId(1)).await);
    }

    #[tokio::test]
    async fn test_banned_entries_skipped() {
        let f = fixture();
        join(&f, 1, Gender::Male, Preference::Any).await;
        join(&f, 2, Gender::Female, Preference::Any).await;
        f.directory
            .update(UserId(1), |p| p.is_banned = true)
            .await
            .unwrap();

        assert!(f.matcher.run_pass(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_pairing_rechecks_blocks_and_bans_under_queue_lock() {
        let f = fixture();
        let a = join(&f, 1, Gender::Male, Preference::Any).await;
        join(&f, 2, Gender::Female, Preference::Any).await;
        let snapshot = f.queue.snapshot().await;
        let (x, y) = (&snapshot.as_slice()[0], &snapshot.as_slice()[1]);
        assert_eq!(x.user_id, UserId(1));

        // Block lands after the pass took its snapshot.
        f.directory
            .update(UserId(2), |p| {
                p.blocked_anon_ids.insert(a.anon_id.clone());
            })
            .await
            .unwrap();
        let attempt = f.matcher.try_pair(x, y, Utc::now()).await.unwrap();
        assert!(matches!(attempt, PairAttempt::Stale { x_live: true }));

        f.directory
            .update(UserId(2), |p| p.blocked_anon_ids.clear())
            .await
            .unwrap();
        f.directory
            .update(UserId(1), |p| p.is_banned = true)
            .await
            .unwrap();
        let attempt = f.matcher.try_pair(x, y, Utc::now()).await.unwrap();
        assert!(matches!(attempt, PairAttempt::Stale { x_live: false }));

        assert!(!f.sessions.is_in_session(UserId(1)).await);
        assert_eq!(f.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_passes_never_double_pair() {
        let f = Arc::new(fixture());
        for id in 0..40 {
            let gender = if id % 2 == 0 { Gender::Male } else { Gender::Female };
            join(&f, id, gender, Preference::Any).await;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.matcher.run_pass(Utc::now()).await
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for session in handle.await.unwrap() {
                total += 1;
                for user in session.user_ids() {
                    assert!(seen.insert(user), "user {user} paired twice");
                }
            }
        }
        assert_eq!(total, 20);
        assert!(f.queue.is_empty().await);
    }
}
