//! The [`ChatService`] facade.
//!
//! Every user-facing operation takes the caller's per-user lock, runs its
//! state transitions, releases the lock and only then hands the resulting
//! payloads to the transport. Payload delivery never happens while any lock
//! is held.

use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use duolog_shared::models::{MonetizeState, MonetizeToken, Report, Session, UserProfile};
use duolog_shared::protocol::{Content, Outbound};
use duolog_shared::repository::{Mutation, Repository};
use duolog_shared::types::{
    AnonId, EndReason, Gender, Preference, ReportId, ReportStatus, TokenId, UserId,
};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::directory::{Registration, SettingsUpdate, UserDirectory};
use crate::error::{PreconditionError, Result, TokenError};
use crate::gate::{challenge_payload, parse_deep_link, GateDecision, GateState, MonetizationGate};
use crate::locks::KeyedLocks;
use crate::matcher::Matcher;
use crate::moderation::{apply_warning, Moderation, WarnOutcome};
use crate::queue::WaitingQueue;
use crate::relay::{MessageRelay, RelayReceipt};
use crate::session::{SessionStore, Termination};
use crate::transport::Transport;

/// Payloads collected under lock, delivered after release.
type Notes = Vec<(UserId, Outbound)>;

const MIN_BACKGROUND_INTERVAL: StdDuration = StdDuration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchOutcome {
    /// Waiting for the matcher.
    Queued,
    /// The gate is due; the search resumes once the token is redeemed.
    Challenged { token: MonetizeToken },
}

/// Result of skip/end/block/report/disconnect as seen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOutcome {
    Ended(Session),
    /// The session was already closed, possibly by the peer. Carries the
    /// winning reason.
    AlreadyEnded(Session),
    NotInSession,
}

impl EndOutcome {
    pub fn session(&self) -> Option<&Session> {
        match self {
            EndOutcome::Ended(s) | EndOutcome::AlreadyEnded(s) => Some(s),
            EndOutcome::NotInSession => None,
        }
    }
}

impl From<Option<Termination>> for EndOutcome {
    fn from(termination: Option<Termination>) -> Self {
        match termination {
            Some(Termination::Ended(s)) => EndOutcome::Ended(s),
            Some(Termination::AlreadyEnded(s)) => EndOutcome::AlreadyEnded(s),
            None => EndOutcome::NotInSession,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipOutcome {
    pub ended: EndOutcome,
    /// Present when the skip ended a session and the initiator was sent
    /// back through the gate.
    pub search: Option<SearchOutcome>,
}

/// What a user may see about their own account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileView {
    pub anon_id: AnonId,
    pub gender: Gender,
    pub preference: Preference,
    pub allow_files: bool,
    pub is_banned: bool,
    pub warning_count: u32,
    pub blocked_count: usize,
    pub monetize: MonetizeState,
    pub gate: GateState,
    pub queued: bool,
    pub in_session: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle_closed: usize,
    pub tokens_expired: usize,
    pub locks_pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub users: usize,
    pub queued: usize,
    pub active_sessions: usize,
    pub pending_tokens: usize,
}

fn notify_peer(termination: &Option<Termination>, initiator: UserId, payload: Outbound) -> Notes {
    match termination {
        Some(Termination::Ended(session)) => session
            .peer_of(initiator)
            .map(|peer| vec![(peer.user_id, payload)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub struct ChatService {
    repo: Arc<dyn Repository>,
    directory: Arc<UserDirectory>,
    queue: Arc<WaitingQueue>,
    sessions: Arc<SessionStore>,
    gate: MonetizationGate,
    matcher: Matcher,
    relay: MessageRelay,
    moderation: Moderation,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: RwLock<CoreConfig>,
    user_locks: KeyedLocks<UserId>,
    match_signal: Notify,
}

impl ChatService {
    /// Start with empty state.
    pub fn new(
        repo: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self::build(
            repo,
            transport,
            clock,
            config,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    /// Start from profiles, active sessions and pending tokens held by the
    /// repository. The waiting queue always starts empty.
    pub fn restore(
        repo: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Result<Self> {
        let users = repo.load_users()?;
        let sessions = repo.load_active_sessions()?;
        let tokens = repo.load_pending_tokens()?;
        info!(
            backend = repo.name(),
            users = users.len(),
            sessions = sessions.len(),
            tokens = tokens.len(),
            "Restored chat state"
        );
        Ok(Self::build(
            repo, transport, clock, config, users, sessions, tokens,
        ))
    }

    fn build(
        repo: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        users: Vec<UserProfile>,
        sessions: Vec<Session>,
        tokens: Vec<MonetizeToken>,
    ) -> Self {
        let directory = Arc::new(UserDirectory::with_users(repo.clone(), users));
        let queue = Arc::new(WaitingQueue::new());
        let sessions = Arc::new(SessionStore::with_sessions(repo.clone(), sessions));

        Self {
            gate: MonetizationGate::with_tokens(directory.clone(), repo.clone(), tokens),
            matcher: Matcher::new(queue.clone(), sessions.clone(), directory.clone()),
            relay: MessageRelay::new(sessions.clone(), directory.clone(), transport.clone()),
            moderation: Moderation::new(directory.clone(), repo.clone()),
            repo,
            directory,
            queue,
            sessions,
            transport,
            clock,
            config: RwLock::new(config),
            user_locks: KeyedLocks::new(),
            match_signal: Notify::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn config(&self) -> CoreConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Change the runtime configuration. Later calls see the new values.
    pub fn update_config<F>(&self, change: F) -> CoreConfig
    where
        F: FnOnce(&mut CoreConfig),
    {
        let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
        change(&mut config);
        info!(?config, "Configuration updated");
        config.clone()
    }

    fn dispatch(&self, notes: Notes) {
        for (to, payload) in notes {
            if let Err(e) = self.transport.deliver(to, payload) {
                debug!(user = %to, error = %e, "Notification not delivered");
            }
        }
    }

    async fn touch(&self, user_id: UserId, now: DateTime<Utc>) {
        if let Err(e) = self.directory.touch(user_id, now).await {
            debug!(user = %user_id, error = %e, "Could not update last activity");
        }
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    pub async fn register(
        &self,
        user_id: UserId,
        registration: &Registration,
    ) -> Result<UserProfile> {
        let _guard = self.user_locks.lock(&user_id).await;
        self.directory
            .register(user_id, registration, self.clock.now())
            .await
    }

    pub async fn profile(&self, user_id: UserId) -> Result<ProfileView> {
        let now = self.clock.now();
        let profile = self.directory.require(user_id).await?;
        let config = self.config();

        Ok(ProfileView {
            gate: self.gate.state(&profile, &config.gate, now).await,
            queued: self.queue.contains(user_id).await,
            in_session: self.sessions.is_in_session(user_id).await,
            blocked_count: profile.blocked_anon_ids.len(),
            anon_id: profile.anon_id,
            gender: profile.gender,
            preference: profile.preference,
            allow_files: profile.allow_files,
            is_banned: profile.is_banned,
            warning_count: profile.warning_count,
            monetize: profile.monetize,
        })
    }

    /// Change settings. A waiting user keeps their place with the new
    /// attributes.
    pub async fn update_settings(
        &self,
        user_id: UserId,
        settings: &SettingsUpdate,
    ) -> Result<UserProfile> {
        let _guard = self.user_locks.lock(&user_id).await;
        let profile = self
            .directory
            .update_settings(user_id, settings, self.clock.now())
            .await?;
        if self.queue.refresh(&profile).await {
            self.match_signal.notify_one();
        }
        Ok(profile)
    }

    // -----------------------------------------------------------------------
    // Searching
    // -----------------------------------------------------------------------

    /// Pass the gate and enter the waiting queue.
    pub async fn find_partner(&self, user_id: UserId) -> Result<SearchOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let (outcome, notes) = self.search_locked(user_id, now).await?;
        self.touch(user_id, now).await;
        drop(guard);

        self.dispatch(notes);
        Ok(outcome)
    }

    async fn search_locked(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(SearchOutcome, Notes)> {
        let profile = self.directory.require(user_id).await?;
        if profile.is_banned {
            return Err(PreconditionError::Banned.into());
        }
        if self.sessions.is_in_session(user_id).await {
            return Err(PreconditionError::AlreadyInSession.into());
        }
        if self.queue.contains(user_id).await {
            return Err(PreconditionError::AlreadyQueued.into());
        }

        let config = self.config();
        match self.gate.check(&profile, &config.gate, now).await? {
            GateDecision::Challenge(token) => {
                let payload = challenge_payload(&token, &config.gate);
                Ok((SearchOutcome::Challenged { token }, vec![(user_id, payload)]))
            }
            GateDecision::Pass => {
                self.queue.enqueue(&profile, now).await?;
                self.match_signal.notify_one();
                Ok((SearchOutcome::Queued, vec![(user_id, Outbound::Searching)]))
            }
        }
    }

    /// Leave the queue. Safe to call at any time.
    pub async fn cancel_search(&self, user_id: UserId) -> bool {
        let _guard = self.user_locks.lock(&user_id).await;
        self.queue.dequeue(user_id).await.is_some()
    }

    /// Run one matching pass and announce the new sessions.
    pub async fn run_match_pass(&self) -> Vec<Session> {
        let now = self.clock.now();
        let created = self.matcher.run_pass(now).await;

        for session in &created {
            let unreachable: Vec<UserId> = session
                .user_ids()
                .into_iter()
                .filter(|&user_id| {
                    self.transport
                        .deliver(user_id, Outbound::PartnerFound)
                        .is_err()
                })
                .collect();
            if let Some(&user_id) = unreachable.first() {
                warn!(session = %session.session_id, user = %user_id, "Participant unreachable at pairing");
                self.close_unreachable(session, &unreachable, now).await;
            }
        }
        created
    }

    async fn close_unreachable(&self, session: &Session, unreachable: &[UserId], now: DateTime<Utc>) {
        match self
            .sessions
            .end(&session.session_id, EndReason::Disconnect, None, now, Vec::new())
            .await
        {
            Ok(Termination::Ended(ended)) => {
                let notes = ended
                    .user_ids()
                    .into_iter()
                    .filter(|u| !unreachable.contains(u))
                    .map(|u| {
                        (
                            u,
                            Outbound::ChatClosed {
                                reason: EndReason::Disconnect,
                            },
                        )
                    })
                    .collect();
                self.dispatch(notes);
            }
            Ok(Termination::AlreadyEnded(_)) => {}
            Err(e) => warn!(session = %session.session_id, error = %e, "Failed to close session"),
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    pub async fn find_active_session(&self, user_id: UserId) -> Result<Session> {
        self.sessions.find_active_for(user_id).await
    }

    /// End the chat and immediately search again.
    pub async fn skip(&self, user_id: UserId) -> Result<SkipOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let termination = self
            .sessions
            .end_for_user(user_id, EndReason::Skip, Some(user_id), now, Vec::new())
            .await?;
        let mut notes = notify_peer(&termination, user_id, Outbound::PartnerLeft);

        let mut search = None;
        if matches!(termination, Some(Termination::Ended(_))) {
            match self.search_locked(user_id, now).await {
                Ok((outcome, more)) => {
                    notes.extend(more);
                    search = Some(outcome);
                }
                Err(e) => warn!(user = %user_id, error = %e, "Search after skip failed"),
            }
        }
        self.touch(user_id, now).await;
        drop(guard);

        self.dispatch(notes);
        Ok(SkipOutcome {
            ended: termination.into(),
            search,
        })
    }

    pub async fn end(&self, user_id: UserId) -> Result<EndOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let termination = self
            .sessions
            .end_for_user(user_id, EndReason::End, Some(user_id), now, Vec::new())
            .await?;
        let notes = notify_peer(&termination, user_id, Outbound::PartnerLeft);
        self.touch(user_id, now).await;
        drop(guard);

        self.dispatch(notes);
        Ok(termination.into())
    }

    /// End the chat and never be matched with this partner again.
    pub async fn block_partner(&self, user_id: UserId) -> Result<EndOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();

        let outcome = match self.sessions.active_for(user_id).await {
            Some(session) => {
                let peer = session
                    .peer_of(user_id)
                    .cloned()
                    .ok_or(PreconditionError::NoActiveSession)?;
                let prepared = self
                    .directory
                    .prepare(user_id, |p| {
                        p.blocked_anon_ids.insert(peer.anon_id.clone());
                        p.last_active_at = now;
                    })
                    .await?;

                let termination = self
                    .sessions
                    .end(
                        &session.session_id,
                        EndReason::Block,
                        Some(user_id),
                        now,
                        vec![Mutation::PutUser(prepared.clone())],
                    )
                    .await?;
                match termination {
                    Termination::Ended(ended) => {
                        self.directory.commit(prepared).await;
                        EndOutcome::Ended(ended)
                    }
                    Termination::AlreadyEnded(ended) => {
                        self.moderation.block(user_id, &peer.anon_id).await?;
                        EndOutcome::AlreadyEnded(ended)
                    }
                }
            }
            None => match self.sessions.last_for(user_id).await {
                Some(last) => {
                    if let Some(peer) = last.peer_of(user_id) {
                        self.moderation.block(user_id, &peer.anon_id).await?;
                    }
                    EndOutcome::AlreadyEnded(last)
                }
                None => EndOutcome::NotInSession,
            },
        };
        drop(guard);

        if let EndOutcome::Ended(session) = &outcome {
            if let Some(peer) = session.peer_of(user_id) {
                self.dispatch(vec![(peer.user_id, Outbound::PartnerLeft)]);
            }
        }
        Ok(outcome)
    }

    /// End the chat and file a report about the partner. The report is best
    /// effort: failing to store it never fails the request.
    pub async fn report_partner(
        &self,
        user_id: UserId,
        reason: Option<&str>,
    ) -> Result<EndOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let termination = self
            .sessions
            .end_for_user(user_id, EndReason::Report, Some(user_id), now, Vec::new())
            .await?;
        let notes = notify_peer(&termination, user_id, Outbound::PartnerLeft);

        let session = match &termination {
            Some(Termination::Ended(s)) => Some(s),
            // A repeated report of the same chat is not filed twice.
            Some(Termination::AlreadyEnded(s))
                if !(s.ended_by == Some(user_id) && s.end_reason == Some(EndReason::Report)) =>
            {
                Some(s)
            }
            _ => None,
        };
        if let Some(session) = session {
            self.file_report(session, user_id, reason, now).await;
        }
        self.touch(user_id, now).await;
        drop(guard);

        self.dispatch(notes);
        Ok(termination.into())
    }

    async fn file_report(
        &self,
        session: &Session,
        reporter: UserId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let result = match Moderation::draft_report(session, reporter, reason, now) {
            Ok(report) => self.moderation.record_report(&report).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(session = %session.session_id, error = %e, "Report could not be stored");
        }
    }

    /// The user's transport went away: leave the queue and close the chat.
    pub async fn disconnect(&self, user_id: UserId) -> Result<EndOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        self.queue.dequeue(user_id).await;
        let termination = self
            .sessions
            .end_for_user(user_id, EndReason::Disconnect, None, now, Vec::new())
            .await?;
        let notes = notify_peer(
            &termination,
            user_id,
            Outbound::ChatClosed {
                reason: EndReason::Disconnect,
            },
        );
        drop(guard);

        self.dispatch(notes);
        Ok(termination.into())
    }

    /// Forward a message to the partner. Delivery does not wait for the
    /// sender's lock; the activity stamp on the profile does.
    pub async fn relay(&self, user_id: UserId, content: Content) -> Result<RelayReceipt> {
        let now = self.clock.now();
        let receipt = self.relay.relay(user_id, content, now).await?;
        let _guard = self.user_locks.lock(&user_id).await;
        self.touch(user_id, now).await;
        Ok(receipt)
    }

    // -----------------------------------------------------------------------
    // Gate
    // -----------------------------------------------------------------------

    pub async fn complete_challenge(
        &self,
        user_id: UserId,
        token: TokenId,
    ) -> Result<MonetizeState> {
        let guard = self.user_locks.lock(&user_id).await;
        let config = self.config();
        let profile = self
            .gate
            .complete(token, user_id, &config.gate, self.clock.now())
            .await?;
        drop(guard);

        if let Some(next_due_at) = profile.monetize.next_due_at {
            self.dispatch(vec![(user_id, Outbound::Unlocked { next_due_at })]);
        }
        Ok(profile.monetize)
    }

    /// Redeem a `monetize_<token>` deep-link payload.
    pub async fn complete_deep_link(
        &self,
        user_id: UserId,
        payload: &str,
    ) -> Result<MonetizeState> {
        let token = parse_deep_link(payload).ok_or(TokenError::TokenNotFound)?;
        self.complete_challenge(user_id, token).await
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Close idle sessions, expire overdue tokens and drop unused locks.
    pub async fn sweep(&self, idle_timeout: Duration) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut notes = Notes::new();

        for session in self.sessions.idle(now, idle_timeout).await {
            match self
                .sessions
                .end_if_idle(&session.session_id, now, idle_timeout)
                .await
            {
                Ok(Some(Termination::Ended(ended))) => {
                    report.idle_closed += 1;
                    notes.extend(ended.user_ids().into_iter().map(|u| {
                        (
                            u,
                            Outbound::ChatClosed {
                                reason: EndReason::Disconnect,
                            },
                        )
                    }));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Idle sweep interrupted");
                    break;
                }
            }
        }

        match self.gate.expire_stale(now).await {
            Ok(expired) => report.tokens_expired = expired,
            Err(e) => warn!(error = %e, "Token sweep failed"),
        }
        report.locks_pruned = self.user_locks.prune();

        self.dispatch(notes);
        if report.idle_closed > 0 || report.tokens_expired > 0 {
            info!(
                idle_closed = report.idle_closed,
                tokens_expired = report.tokens_expired,
                "Sweep finished"
            );
        }
        report
    }

    // -----------------------------------------------------------------------
    // Moderation
    // -----------------------------------------------------------------------

    /// Block by anonymous id, outside of any chat.
    pub async fn block(&self, user_id: UserId, target: &AnonId) -> Result<bool> {
        let _guard = self.user_locks.lock(&user_id).await;
        self.moderation.block(user_id, target).await
    }

    pub async fn blocked_list(&self, user_id: UserId) -> Result<Vec<AnonId>> {
        self.moderation.blocked_list(user_id).await
    }

    pub async fn ban(&self, user_id: UserId) -> Result<UserProfile> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let prepared = self
            .directory
            .prepare(user_id, |p| p.is_banned = true)
            .await?;
        let (profile, mut notes) = self.commit_moderated(prepared, now).await?;
        drop(guard);

        notes.push((user_id, Outbound::Banned));
        self.dispatch(notes);
        info!(user = %user_id, "User banned");
        Ok(profile)
    }

    pub async fn unban(&self, user_id: UserId) -> Result<UserProfile> {
        let _guard = self.user_locks.lock(&user_id).await;
        self.moderation.unban(user_id).await
    }

    /// Warn a user; at the configured threshold this is a ban. A non-blank
    /// `reason` is passed on to the user.
    pub async fn warn(&self, user_id: UserId, reason: Option<&str>) -> Result<WarnOutcome> {
        let guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let threshold = self.config().moderation.warn_threshold;

        let mut outcome = WarnOutcome {
            warning_count: 0,
            threshold,
            banned: false,
        };
        let prepared = self
            .directory
            .prepare(user_id, |p| outcome = apply_warning(p, threshold))
            .await?;
        let (_, mut notes) = self.commit_moderated(prepared, now).await?;
        drop(guard);

        notes.push((
            user_id,
            Outbound::Warned {
                count: outcome.warning_count,
                threshold,
                reason: reason
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string),
            },
        ));
        if outcome.banned {
            notes.push((user_id, Outbound::Banned));
        }
        self.dispatch(notes);
        Ok(outcome)
    }

    /// Persist a moderated profile. A banned profile leaves the queue and its
    /// active chat in the same batch that stores the ban. If that batch
    /// fails, the user keeps their place in the queue.
    async fn commit_moderated(
        &self,
        prepared: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(UserProfile, Notes)> {
        let dequeued = if prepared.is_banned {
            self.queue.dequeue(prepared.user_id).await
        } else {
            None
        };

        let result = self.persist_moderated(prepared, now).await;
        if result.is_err() {
            if let Some(entry) = dequeued {
                self.queue.restore(entry).await;
            }
        }
        result
    }

    async fn persist_moderated(
        &self,
        prepared: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(UserProfile, Notes)> {
        let user_id = prepared.user_id;
        let mut notes = Notes::new();

        if prepared.is_banned {
            if let Some(session) = self.sessions.active_for(user_id).await {
                let termination = self
                    .sessions
                    .end(
                        &session.session_id,
                        EndReason::End,
                        None,
                        now,
                        vec![Mutation::PutUser(prepared.clone())],
                    )
                    .await?;
                if let Termination::Ended(ended) = termination {
                    if let Some(peer) = ended.peer_of(user_id) {
                        notes.push((peer.user_id, Outbound::PartnerLeft));
                    }
                    self.directory.commit(prepared.clone()).await;
                    return Ok((prepared, notes));
                }
            }
        }

        self.repo.apply(&[Mutation::PutUser(prepared.clone())])?;
        self.directory.commit(prepared.clone()).await;
        Ok((prepared, notes))
    }

    pub async fn set_monetize_override(
        &self,
        user_id: UserId,
        enabled: Option<bool>,
    ) -> Result<UserProfile> {
        let _guard = self.user_locks.lock(&user_id).await;
        self.moderation.set_monetize_override(user_id, enabled).await
    }

    pub async fn list_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>> {
        self.moderation.list_reports(status).await
    }

    pub async fn review_report(
        &self,
        report_id: &ReportId,
        admin_notes: Option<String>,
    ) -> Result<Report> {
        self.moderation.review_report(report_id, admin_notes).await
    }

    pub async fn user(&self, user_id: UserId) -> Result<UserProfile> {
        self.directory.require(user_id).await
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            users: self.directory.len().await,
            queued: self.queue.len().await,
            active_sessions: self.sessions.active_count().await,
            pending_tokens: self.gate.pending_count().await,
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Run matching passes on every queue change and every `interval`.
    pub fn spawn_matcher(self: &Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_BACKGROUND_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = service.match_signal.notified() => {}
                }
                service.run_match_pass().await;
            }
        })
    }

    /// Run [`ChatService::sweep`] every `interval`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: StdDuration,
        idle_timeout: Duration,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_BACKGROUND_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.sweep(idle_timeout).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CoreError;
    use crate::testing::FlakyRepository;
    use crate::transport::ChannelTransport;
    use tokio::sync::mpsc;

    struct Harness {
        service: Arc<ChatService>,
        transport: Arc<ChannelTransport>,
        clock: Arc<ManualClock>,
        repo: Arc<FlakyRepository>,
    }

    fn harness(gate_enabled: bool) -> Harness {
        let repo = FlakyRepository::new();
        let transport = Arc::new(ChannelTransport::new());
        let clock = Arc::new(ManualClock::default());
        let mut config = CoreConfig::default();
        config.gate.enabled = gate_enabled;
        config.moderation.warn_threshold = 2;

        let service = Arc::new(ChatService::new(
            repo.clone(),
            transport.clone(),
            clock.clone(),
            config,
        ));
        Harness {
            service,
            transport,
            clock,
            repo,
        }
    }

    async fn join(
        h: &Harness,
        id: i64,
        gender: Gender,
        preference: Preference,
    ) -> mpsc::Receiver<Outbound> {
        let rx = h.transport.subscribe(UserId(id));
        h.service
            .register(
                UserId(id),
                &Registration {
                    gender,
                    preference,
                    allow_files: false,
                },
            )
            .await
            .unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload);
        }
        out
    }

    /// Register two users, queue both and pair them.
    async fn paired(
        h: &Harness,
    ) -> (
        mpsc::Receiver<Outbound>,
        mpsc::Receiver<Outbound>,
        Session,
    ) {
        let mut a = join(h, 1, Gender::Male, Preference::Any).await;
        let mut b = join(h, 2, Gender::Female, Preference::Any).await;
        h.service.find_partner(UserId(1)).await.unwrap();
        h.service.find_partner(UserId(2)).await.unwrap();
        let mut created = h.service.run_match_pass().await;
        assert_eq!(created.len(), 1);
        drain(&mut a);
        drain(&mut b);
        (a, b, created.remove(0))
    }

    #[tokio::test]
    async fn test_pair_relay_block_scenario() {
        let h = harness(false);
        let mut a = join(&h, 1, Gender::Male, Preference::Any).await;
        let mut b = join(&h, 2, Gender::Female, Preference::Opposite).await;

        assert_eq!(
            h.service.find_partner(UserId(1)).await.unwrap(),
            SearchOutcome::Queued
        );
        assert_eq!(
            h.service.find_partner(UserId(2)).await.unwrap(),
            SearchOutcome::Queued
        );
        let created = h.service.run_match_pass().await;
        assert_eq!(created.len(), 1);
        assert!(created[0].is_active());
        assert_eq!(drain(&mut a), vec![Outbound::Searching, Outbound::PartnerFound]);
        assert_eq!(drain(&mut b), vec![Outbound::Searching, Outbound::PartnerFound]);

        h.service
            .relay(UserId(1), Content::text("hi"))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut b),
            vec![Outbound::PartnerMessage {
                from: "Partner".into(),
                kind: duolog_shared::ContentKind::Text,
                text: Some("hi".into()),
                file_ref: None,
            }]
        );

        let outcome = h.service.block_partner(UserId(2)).await.unwrap();
        let ended = outcome.session().unwrap();
        assert!(matches!(outcome, EndOutcome::Ended(_)));
        assert_eq!(ended.end_reason, Some(EndReason::Block));
        assert!(!ended.is_active());
        assert_eq!(drain(&mut a), vec![Outbound::PartnerLeft]);

        let a_anon = h.service.user(UserId(1)).await.unwrap().anon_id;
        assert_eq!(h.service.blocked_list(UserId(2)).await.unwrap(), vec![a_anon]);

        // They never meet again.
        h.service.find_partner(UserId(1)).await.unwrap();
        h.service.find_partner(UserId(2)).await.unwrap();
        assert!(h.service.run_match_pass().await.is_empty());

        let _c = join(&h, 3, Gender::Female, Preference::Any).await;
        h.service.find_partner(UserId(3)).await.unwrap();
        let created = h.service.run_match_pass().await;
        assert_eq!(created.len(), 1);
        assert!(created[0].involves(UserId(1)) && created[0].involves(UserId(3)));
    }

    #[tokio::test]
    async fn test_gate_scenario() {
        let h = harness(true);
        let mut rx = join(&h, 1, Gender::Male, Preference::Any).await;
        let t0 = h.clock.now();

        let token = match h.service.find_partner(UserId(1)).await.unwrap() {
            SearchOutcome::Challenged { token } => token,
            other => panic!("expected a challenge, got {other:?}"),
        };
        assert_eq!(token.expires_at, t0 + Duration::minutes(30));
        assert!(!h.service.profile(UserId(1)).await.unwrap().queued);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::Challenge { .. }]
        ));
        assert_eq!(
            h.service.profile(UserId(1)).await.unwrap().gate,
            GateState::Challenged
        );

        h.clock.advance(Duration::seconds(3));
        let err = h
            .service
            .complete_challenge(UserId(1), token.token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Token(TokenError::TooSoon { remaining_secs: 7 })
        ));

        h.clock.advance(Duration::seconds(10));
        let completed_at = h.clock.now();
        let state = h
            .service
            .complete_deep_link(UserId(1), &format!("monetize_{}", token.token))
            .await
            .unwrap();
        assert_eq!(state.next_due_at, Some(completed_at + Duration::hours(12)));
        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Unlocked {
                next_due_at: completed_at + Duration::hours(12)
            }]
        );
        assert_eq!(
            h.service.profile(UserId(1)).await.unwrap().gate,
            GateState::Clear
        );

        assert_eq!(
            h.service.find_partner(UserId(1)).await.unwrap(),
            SearchOutcome::Queued
        );
    }

    #[tokio::test]
    async fn test_double_skip_is_noop() {
        let h = harness(false);
        let (_a, mut b, session) = paired(&h).await;

        let first = h.service.skip(UserId(1)).await.unwrap();
        assert!(matches!(first.ended, EndOutcome::Ended(_)));
        assert_eq!(first.search, Some(SearchOutcome::Queued));

        let second = h.service.skip(UserId(1)).await.unwrap();
        match second.ended {
            EndOutcome::AlreadyEnded(s) => {
                assert_eq!(s.session_id, session.session_id);
                assert_eq!(s.end_reason, Some(EndReason::Skip));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(second.search, None);

        assert_eq!(h.service.stats().await.queued, 1);
        assert_eq!(drain(&mut b), vec![Outbound::PartnerLeft]);
        // Peer is not re-enqueued.
        assert!(!h.service.profile(UserId(2)).await.unwrap().queued);
    }

    #[tokio::test]
    async fn test_concurrent_double_skip_single_winner() {
        let h = harness(false);
        let (_a, mut b, session) = paired(&h).await;

        let (first, second) = tokio::join!(h.service.skip(UserId(1)), h.service.skip(UserId(1)));
        let (first, second) = (first.unwrap(), second.unwrap());

        let outcomes = [&first, &second];
        let winners: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o.ended, EndOutcome::Ended(_)))
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].search, Some(SearchOutcome::Queued));

        let loser = outcomes
            .iter()
            .find(|o| matches!(o.ended, EndOutcome::AlreadyEnded(_)))
            .unwrap();
        assert_eq!(loser.search, None);
        let ended = loser.ended.session().unwrap();
        assert_eq!(ended.session_id, session.session_id);
        assert_eq!(ended.end_reason, Some(EndReason::Skip));

        assert_eq!(drain(&mut b), vec![Outbound::PartnerLeft]);
        assert_eq!(h.service.stats().await.queued, 1);
    }

    #[tokio::test]
    async fn test_concurrent_terminations_single_winner() {
        let h = harness(false);
        let (_a, _b, _) = paired(&h).await;

        let (skip, end) = tokio::join!(h.service.skip(UserId(1)), h.service.end(UserId(2)));
        let skip = skip.unwrap();
        let end = end.unwrap();

        let winners = [
            matches!(skip.ended, EndOutcome::Ended(_)),
            matches!(end, EndOutcome::Ended(_)),
        ];
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);

        let skip_reason = skip.ended.session().unwrap().end_reason;
        let end_reason = end.session().unwrap().end_reason;
        assert_eq!(skip_reason, end_reason);
    }

    #[tokio::test]
    async fn test_report_survives_storage_failure() {
        let h = harness(false);
        let (_a, mut b, _) = paired(&h).await;

        h.repo.set_failing_reports(true);
        let outcome = h
            .service
            .report_partner(UserId(1), Some("spam"))
            .await
            .unwrap();
        assert!(matches!(outcome, EndOutcome::Ended(_)));
        assert_eq!(outcome.session().unwrap().end_reason, Some(EndReason::Report));
        assert_eq!(drain(&mut b), vec![Outbound::PartnerLeft]);
        assert!(h.service.list_reports(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_recorded_once() {
        let h = harness(false);
        let (_a, _b, session) = paired(&h).await;

        h.service.report_partner(UserId(1), None).await.unwrap();
        h.service.report_partner(UserId(1), None).await.unwrap();

        let reports = h.service.list_reports(Some(ReportStatus::Pending)).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].session_id, session.session_id);
        assert_eq!(
            reports[0].reported_anon_id,
            h.service.user(UserId(2)).await.unwrap().anon_id
        );
    }

    #[tokio::test]
    async fn test_search_preconditions() {
        let h = harness(false);
        let (_a, _b, _) = paired(&h).await;
        assert!(matches!(
            h.service.find_partner(UserId(1)).await,
            Err(CoreError::Precondition(PreconditionError::AlreadyInSession))
        ));

        let _c = join(&h, 3, Gender::Other, Preference::Other).await;
        h.service.find_partner(UserId(3)).await.unwrap();
        assert!(matches!(
            h.service.find_partner(UserId(3)).await,
            Err(CoreError::Precondition(PreconditionError::AlreadyQueued))
        ));
        assert!(h.service.cancel_search(UserId(3)).await);
        assert!(!h.service.cancel_search(UserId(3)).await);

        assert!(matches!(
            h.service.find_partner(UserId(99)).await,
            Err(CoreError::Precondition(PreconditionError::NotRegistered))
        ));
    }

    #[tokio::test]
    async fn test_ban_closes_chat() {
        let h = harness(false);
        let (mut a, mut b, _) = paired(&h).await;

        h.service.ban(UserId(1)).await.unwrap();
        assert_eq!(drain(&mut a), vec![Outbound::Banned]);
        assert_eq!(drain(&mut b), vec![Outbound::PartnerLeft]);
        assert!(h.service.find_active_session(UserId(2)).await.is_err());
        assert!(matches!(
            h.service.find_partner(UserId(1)).await,
            Err(CoreError::Precondition(PreconditionError::Banned))
        ));

        h.service.unban(UserId(1)).await.unwrap();
        h.service.find_partner(UserId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_warn_threshold_bans_and_dequeues() {
        let h = harness(false);
        let mut rx = join(&h, 1, Gender::Male, Preference::Any).await;
        h.service.find_partner(UserId(1)).await.unwrap();

        let first = h.service.warn(UserId(1), Some(" spamming links ")).await.unwrap();
        assert!(!first.banned);
        let second = h.service.warn(UserId(1), Some("  ")).await.unwrap();
        assert!(second.banned);
        assert_eq!(second.warning_count, 2);

        assert_eq!(h.service.stats().await.queued, 0);
        let received = drain(&mut rx);
        assert!(received.contains(&Outbound::Warned {
            count: 1,
            threshold: 2,
            reason: Some("spamming links".into()),
        }));
        assert!(received.contains(&Outbound::Warned {
            count: 2,
            threshold: 2,
            reason: None,
        }));
        assert_eq!(received.last(), Some(&Outbound::Banned));
    }

    #[tokio::test]
    async fn test_disconnect_closes_chat_and_queue() {
        let h = harness(false);
        let (_a, mut b, _) = paired(&h).await;

        let outcome = h.service.disconnect(UserId(1)).await.unwrap();
        let ended = outcome.session().unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Disconnect));
        assert_eq!(ended.ended_by, None);
        assert_eq!(
            drain(&mut b),
            vec![Outbound::ChatClosed {
                reason: EndReason::Disconnect
            }]
        );

        h.service.find_partner(UserId(2)).await.unwrap();
        assert_eq!(
            h.service.disconnect(UserId(2)).await.unwrap(),
            EndOutcome::AlreadyEnded(ended.clone())
        );
        assert_eq!(h.service.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let h = harness(false);
        let (mut a, mut b, _) = paired(&h).await;
        let timeout = Duration::minutes(30);

        h.clock.advance(Duration::minutes(20));
        assert_eq!(h.service.sweep(timeout).await.idle_closed, 0);

        h.clock.advance(Duration::minutes(11));
        assert_eq!(h.service.sweep(timeout).await.idle_closed, 1);
        let closed = Outbound::ChatClosed {
            reason: EndReason::Disconnect,
        };
        assert_eq!(drain(&mut a), vec![closed.clone()]);
        assert_eq!(drain(&mut b), vec![closed]);
    }

    #[tokio::test]
    async fn test_unreachable_partner_at_pairing() {
        let h = harness(false);
        let mut a = join(&h, 1, Gender::Male, Preference::Any).await;
        drop(join(&h, 2, Gender::Female, Preference::Any).await);

        h.service.find_partner(UserId(1)).await.unwrap();
        h.service.find_partner(UserId(2)).await.unwrap();
        assert_eq!(h.service.run_match_pass().await.len(), 1);

        assert!(h.service.find_active_session(UserId(1)).await.is_err());
        assert_eq!(
            drain(&mut a),
            vec![
                Outbound::Searching,
                Outbound::PartnerFound,
                Outbound::ChatClosed {
                    reason: EndReason::Disconnect
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_block_changes_nothing() {
        let h = harness(false);
        let (_a, _b, _) = paired(&h).await;

        h.repo.set_failing(true);
        let err = h.service.block_partner(UserId(1)).await.unwrap_err();
        assert!(err.is_transient());
        h.repo.set_failing(false);

        assert!(h.service.find_active_session(UserId(1)).await.is_ok());
        assert!(h.service.blocked_list(UserId(1)).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_block_persists_while_sender_relays() {
        for _ in 0..40 {
            let h = harness(false);
            let (_a, mut b, _) = paired(&h).await;
            h.repo.set_write_delay(StdDuration::from_micros(300));

            let drainer = tokio::spawn(async move { while b.recv().await.is_some() {} });
            let sender = {
                let service = h.service.clone();
                tokio::spawn(async move {
                    while service.relay(UserId(1), Content::text("hi")).await.is_ok() {}
                })
            };
            tokio::time::sleep(StdDuration::from_millis(1)).await;
            h.service.block_partner(UserId(1)).await.unwrap();
            sender.await.unwrap();
            drainer.abort();

            let stored = h.repo.load_users().unwrap();
            let sender_profile = stored.iter().find(|p| p.user_id == UserId(1)).unwrap();
            assert_eq!(sender_profile.blocked_anon_ids.len(), 1);
            assert_eq!(h.service.blocked_list(UserId(1)).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_ban_keeps_queue_place() {
        let h = harness(false);
        let _a = join(&h, 1, Gender::Male, Preference::Any).await;
        let _b = join(&h, 2, Gender::Female, Preference::Any).await;
        h.service.find_partner(UserId(1)).await.unwrap();
        h.service.find_partner(UserId(2)).await.unwrap();

        h.repo.set_failing(true);
        assert!(h.service.ban(UserId(1)).await.unwrap_err().is_transient());
        h.repo.set_failing(false);

        let profile = h.service.profile(UserId(1)).await.unwrap();
        assert!(!profile.is_banned);
        assert!(profile.queued);
        assert_eq!(h.repo.load_users().unwrap().iter().filter(|p| p.is_banned).count(), 0);

        let created = h.service.run_match_pass().await;
        assert_eq!(created.len(), 1);
        assert!(created[0].involves(UserId(1)) && created[0].involves(UserId(2)));
    }

    #[tokio::test]
    async fn test_restore_from_repository() {
        let h = harness(false);
        let (_a, _b, session) = paired(&h).await;

        let restored = ChatService::restore(
            h.repo.clone(),
            h.transport.clone(),
            h.clock.clone(),
            h.service.config(),
        )
        .unwrap();
        assert_eq!(
            restored.find_active_session(UserId(2)).await.unwrap().session_id,
            session.session_id
        );
        let stats = restored.stats().await;
        assert_eq!(stats.users, 2);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_runtime_config_change() {
        let h = harness(false);
        let _rx = join(&h, 1, Gender::Male, Preference::Any).await;

        h.service.update_config(|c| c.gate.enabled = true);
        assert!(matches!(
            h.service.find_partner(UserId(1)).await.unwrap(),
            SearchOutcome::Challenged { .. }
        ));

        h.service
            .set_monetize_override(UserId(1), Some(false))
            .await
            .unwrap();
        assert_eq!(
            h.service.find_partner(UserId(1)).await.unwrap(),
            SearchOutcome::Queued
        );
    }

    #[tokio::test]
    async fn test_background_matcher_pairs_on_signal() {
        let h = harness(false);
        let mut a = join(&h, 1, Gender::Male, Preference::Any).await;
        let _b = join(&h, 2, Gender::Female, Preference::Any).await;
        let handle = h.service.spawn_matcher(StdDuration::from_secs(3600));

        h.service.find_partner(UserId(1)).await.unwrap();
        h.service.find_partner(UserId(2)).await.unwrap();

        let found = tokio::time::timeout(StdDuration::from_secs(2), async {
            loop {
                if let Some(Outbound::PartnerFound) = a.recv().await {
                    break;
                }
            }
        })
        .await;
        handle.abort();
        assert!(found.is_ok());
    }
}
