//! Monetization gate.
//!
//! Once a user's `next_due_at` has passed, searching for a partner first
//! requires completing a challenge: visit the configured link, then redeem
//! the single-use token it came with. A valid redemption unlocks the next
//! `interval_hours`. Token state and the profile's gate fields change in one
//! repository batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use duolog_shared::constants::MONETIZE_DEEP_LINK_PREFIX;
use duolog_shared::models::{MonetizeToken, UserProfile};
use duolog_shared::protocol::Outbound;
use duolog_shared::repository::{Mutation, Repository};
use duolog_shared::types::{TokenId, TokenStatus, UserId};

use crate::config::GateConfig;
use crate::directory::UserDirectory;
use crate::error::{Result, TokenError};

/// Finished tokens stay answerable (`TokenAlreadyUsed`, `TokenExpired`) for
/// this long after their expiry before being dropped from memory.
const FINISHED_TOKEN_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Searching is unrestricted.
    Clear,
    /// The next search will issue a challenge.
    Due,
    /// A challenge is out and still redeemable.
    Challenged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Challenge(MonetizeToken),
}

/// Whether the gate applies to this user at all. A per-user override wins
/// over the global switch.
pub fn is_gated(profile: &UserProfile, config: &GateConfig) -> bool {
    profile.monetize.enabled.unwrap_or(config.enabled)
}

pub fn is_due(profile: &UserProfile, config: &GateConfig, now: DateTime<Utc>) -> bool {
    is_gated(profile, config)
        && profile
            .monetize
            .next_due_at
            .is_some_and(|due| now >= due)
}

pub fn deep_link_payload(token: TokenId) -> String {
    format!("{MONETIZE_DEEP_LINK_PREFIX}{token}")
}

/// Extract the token from a `monetize_<token>` start payload.
pub fn parse_deep_link(payload: &str) -> Option<TokenId> {
    payload
        .trim()
        .strip_prefix(MONETIZE_DEEP_LINK_PREFIX)?
        .parse()
        .ok()
}

/// The payload presenting a freshly issued token to its owner.
pub fn challenge_payload(token: &MonetizeToken, config: &GateConfig) -> Outbound {
    Outbound::Challenge {
        token: token.token,
        link: token.link.clone(),
        deep_link_payload: deep_link_payload(token.token),
        expires_at: token.expires_at,
        unlock_hours: config.interval_hours,
    }
}

pub struct MonetizationGate {
    tokens: Mutex<HashMap<TokenId, MonetizeToken>>,
    directory: Arc<UserDirectory>,
    repo: Arc<dyn Repository>,
}

impl MonetizationGate {
    pub fn new(directory: Arc<UserDirectory>, repo: Arc<dyn Repository>) -> Self {
        Self::with_tokens(directory, repo, Vec::new())
    }

    pub fn with_tokens(
        directory: Arc<UserDirectory>,
        repo: Arc<dyn Repository>,
        tokens: Vec<MonetizeToken>,
    ) -> Self {
        Self {
            tokens: Mutex::new(tokens.into_iter().map(|t| (t.token, t)).collect()),
            directory,
            repo,
        }
    }

    /// Pass, or issue a new pending token when the gate is due.
    pub async fn check(
        &self,
        profile: &UserProfile,
        config: &GateConfig,
        now: DateTime<Utc>,
    ) -> Result<GateDecision> {
        if !is_due(profile, config, now) {
            return Ok(GateDecision::Pass);
        }

        let token = MonetizeToken {
            token: TokenId::generate(),
            user_id: profile.user_id,
            created_at: now,
            expires_at: now + config.token_ttl(),
            status: TokenStatus::Pending,
            link: config.short_url.clone(),
        };

        let mut tokens = self.tokens.lock().await;
        self.repo.apply(&[Mutation::PutToken(token.clone())])?;
        tokens.insert(token.token, token.clone());

        info!(user = %profile.user_id, expires_at = %token.expires_at, "Gate challenge issued");
        Ok(GateDecision::Challenge(token))
    }

    /// Redeem `token_id` on behalf of `claimant`. On success the profile is
    /// unlocked until `now + interval` and returned.
    pub async fn complete(
        &self,
        token_id: TokenId,
        claimant: UserId,
        config: &GateConfig,
        now: DateTime<Utc>,
    ) -> Result<UserProfile> {
        let mut tokens = self.tokens.lock().await;
        let token = tokens
            .get(&token_id)
            .cloned()
            .ok_or(TokenError::TokenNotFound)?;

        if token.user_id != claimant {
            return Err(TokenError::NotTokenOwner.into());
        }
        match token.status {
            TokenStatus::Completed => return Err(TokenError::TokenAlreadyUsed.into()),
            TokenStatus::Expired => return Err(TokenError::TokenExpired.into()),
            TokenStatus::Pending => {}
        }

        if token.is_past_ttl(now) {
            let mut expired = token;
            expired.status = TokenStatus::Expired;
            self.repo.apply(&[Mutation::PutToken(expired.clone())])?;
            tokens.insert(token_id, expired);
            return Err(TokenError::TokenExpired.into());
        }

        let elapsed = now - token.created_at;
        if elapsed < config.min_wait() {
            let remaining = config.min_wait() - elapsed;
            let remaining_secs = (remaining.num_milliseconds() + 999) / 1000;
            debug!(user = %claimant, remaining_secs, "Challenge completed too fast");
            return Err(TokenError::TooSoon { remaining_secs }.into());
        }

        let profile = self
            .directory
            .prepare(claimant, |p| {
                p.monetize.last_completed_at = Some(now);
                p.monetize.next_due_at = Some(now + config.interval());
            })
            .await?;

        let mut completed = token;
        completed.status = TokenStatus::Completed;
        self.repo.apply(&[
            Mutation::PutToken(completed.clone()),
            Mutation::PutUser(profile.clone()),
        ])?;
        tokens.insert(token_id, completed);
        self.directory.commit(profile.clone()).await;

        info!(user = %claimant, next_due_at = ?profile.monetize.next_due_at, "Gate challenge completed");
        Ok(profile)
    }

    pub async fn state(
        &self,
        profile: &UserProfile,
        config: &GateConfig,
        now: DateTime<Utc>,
    ) -> GateState {
        if !is_due(profile, config, now) {
            return GateState::Clear;
        }
        let challenged = self
            .tokens
            .lock()
            .await
            .values()
            .any(|t| t.user_id == profile.user_id && t.is_pending() && !t.is_past_ttl(now));
        if challenged {
            GateState::Challenged
        } else {
            GateState::Due
        }
    }

    /// Mark pending tokens past their TTL as expired and drop finished ones
    /// past the retention window. Returns the number newly expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tokens = self.tokens.lock().await;
        let expired: Vec<MonetizeToken> = tokens
            .values()
            .filter(|t| t.is_pending() && t.is_past_ttl(now))
            .map(|t| MonetizeToken {
                status: TokenStatus::Expired,
                ..t.clone()
            })
            .collect();

        if !expired.is_empty() {
            let batch: Vec<Mutation> = expired.iter().cloned().map(Mutation::PutToken).collect();
            self.repo.apply(&batch)?;
            for token in &expired {
                tokens.insert(token.token, token.clone());
            }
            info!(count = expired.len(), "Expired stale gate tokens");
        }

        let cutoff = now - Duration::hours(FINISHED_TOKEN_RETENTION_HOURS);
        tokens.retain(|_, t| t.is_pending() || t.expires_at > cutoff);
        Ok(expired.len())
    }

    pub async fn get(&self, token_id: TokenId) -> Option<MonetizeToken> {
        self.tokens.lock().await.get(&token_id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.tokens
            .lock()
            .await
            .values()
            .filter(|t| t.is_pending())
            .count()
    }
}
