use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use duolog_core::directory::{Registration, SettingsUpdate};
use duolog_core::moderation::WarnOutcome;
use duolog_core::relay::RelayReceipt;
use duolog_core::service::{EndOutcome, ProfileView, SearchOutcome, ServiceStats};
use duolog_core::{ChannelTransport, ChatService, CoreConfig};
use duolog_shared::protocol::{Content, Outbound};
use duolog_shared::{
    AnonId, EndReason, MonetizeState, Report, ReportId, ReportStatus, SessionId, TokenId,
    UserId, UserProfile,
};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::mailbox::Mailboxes;
use crate::rate_limit::RateLimiter;

const MAX_POLL_WAIT_SECS: u64 = 30;
const MAX_POLL_BATCH: usize = 100;

/// Header carrying the gateway secret on `/users/*` requests.
pub const GATEWAY_HEADER: &str = "x-gateway-token";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub mailboxes: Arc<Mailboxes>,
    pub relay_limiter: RateLimiter<UserId>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        service: Arc<ChatService>,
        transport: Arc<ChannelTransport>,
        config: ServerConfig,
    ) -> Self {
        Self {
            service,
            mailboxes: Arc::new(Mailboxes::new(transport)),
            relay_limiter: RateLimiter::new(config.relay_rate_per_sec, config.relay_burst),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let users = Router::new()
        .route("/users/:id/start", post(start))
        .route("/users/:id/profile", get(profile))
        .route("/users/:id/settings", post(update_settings))
        .route("/users/:id/search", post(search).delete(cancel_search))
        .route("/users/:id/session", get(active_session))
        .route("/users/:id/messages", post(send_message))
        .route("/users/:id/skip", post(skip))
        .route("/users/:id/end", post(end))
        .route("/users/:id/block", post(block_partner))
        .route("/users/:id/report", post(report_partner))
        .route("/users/:id/disconnect", post(disconnect))
        .route("/users/:id/blocks", get(blocked_list).post(block_by_anon))
        .route("/users/:id/updates", get(updates))
        .route("/users/:id/monetize/complete", post(complete_challenge))
        .route_layer(middleware::from_fn_with_state(
            state.config.clone(),
            require_gateway,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(users)
        .route("/admin/stats", get(admin_stats))
        .route("/admin/config", get(admin_config).patch(admin_update_config))
        .route("/admin/users/:id", get(admin_user))
        .route("/admin/users/:id/ban", post(admin_ban))
        .route("/admin/users/:id/unban", post(admin_unban))
        .route("/admin/users/:id/warn", post(admin_warn))
        .route("/admin/users/:id/monetize", post(admin_monetize_override))
        .route("/admin/reports", get(admin_reports))
        .route("/admin/reports/:id/review", post(admin_review_report))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// What the initiator learns about a closed chat. When the chat was already
/// closed, `reason` is the one it was closed with, whoever closed it.
#[derive(Debug, Serialize)]
struct SessionResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<EndReason>,
}

impl From<&EndOutcome> for SessionResponse {
    fn from(outcome: &EndOutcome) -> Self {
        match outcome {
            EndOutcome::Ended(s) => Self {
                status: "ended",
                session_id: Some(s.session_id.clone()),
                reason: s.end_reason,
            },
            EndOutcome::AlreadyEnded(s) => Self {
                status: "already_ended",
                session_id: Some(s.session_id.clone()),
                reason: s.end_reason,
            },
            EndOutcome::NotInSession => Self {
                status: "not_in_session",
                session_id: None,
                reason: None,
            },
        }
    }
}

#[derive(Serialize)]
struct SkipResponse {
    #[serde(flatten)]
    ended: SessionResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    search: Option<SearchOutcome>,
}

#[derive(Serialize)]
struct ActiveSessionResponse {
    session_id: SessionId,
    started_at: DateTime<Utc>,
    message_count: u64,
    last_activity_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ReportRequest {
    reason: Option<String>,
}

#[derive(Deserialize)]
struct BlockRequest {
    anon_id: AnonId,
}

#[derive(Deserialize)]
struct UpdatesQuery {
    wait_secs: Option<u64>,
    limit: Option<usize>,
}

/// Either the raw token or the `monetize_<token>` deep-link payload.
#[derive(Deserialize)]
struct CompleteRequest {
    token: Option<TokenId>,
    deep_link: Option<String>,
}

#[derive(Serialize)]
struct AdminStatsResponse {
    #[serde(flatten)]
    stats: ServiceStats,
    open_mailboxes: usize,
    uptime_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    monetize_enabled: Option<bool>,
    interval_hours: Option<i64>,
    token_ttl_minutes: Option<i64>,
    min_wait_seconds: Option<i64>,
    short_url: Option<String>,
    warn_threshold: Option<u32>,
}

impl ConfigPatch {
    fn validate(&self) -> Result<(), ApiError> {
        if self.interval_hours.is_some_and(|h| h <= 0)
            || self.token_ttl_minutes.is_some_and(|m| m <= 0)
            || self.min_wait_seconds.is_some_and(|s| s < 0)
        {
            return Err(ApiError::BadRequest(
                "Durations must be positive".to_string(),
            ));
        }
        if self.short_url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(ApiError::BadRequest("short_url must not be empty".to_string()));
        }
        Ok(())
    }

    fn apply(self, config: &mut CoreConfig) {
        if let Some(enabled) = self.monetize_enabled {
            config.gate.enabled = enabled;
        }
        if let Some(hours) = self.interval_hours {
            config.gate.interval_hours = hours;
        }
        if let Some(minutes) = self.token_ttl_minutes {
            config.gate.token_ttl_minutes = minutes;
        }
        if let Some(seconds) = self.min_wait_seconds {
            config.gate.min_wait_seconds = seconds;
        }
        if let Some(url) = self.short_url {
            config.gate.short_url = url;
        }
        if let Some(threshold) = self.warn_threshold {
            config.moderation.warn_threshold = threshold;
        }
    }
}

#[derive(Deserialize)]
struct WarnRequest {
    reason: Option<String>,
}

#[derive(Deserialize)]
struct MonetizeOverrideRequest {
    enabled: Option<bool>,
}

#[derive(Deserialize)]
struct ReportsQuery {
    status: Option<ReportStatus>,
}

#[derive(Deserialize)]
struct ReviewRequest {
    admin_notes: Option<String>,
}

// ---------------------------------------------------------------------------
// User routes
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Only the chat gateway may act for a user id; anyone else could read
/// that user's mailbox.
async fn require_gateway(
    State(config): State<Arc<ServerConfig>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(ref expected) = config.gateway_token else {
        return Err(ApiError::Forbidden(
            "User API is disabled (no GATEWAY_TOKEN configured)".into(),
        ));
    };

    let presented = req
        .headers()
        .get(GATEWAY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !tokens_match(presented, expected) {
        warn!(path = %req.uri().path(), "Rejected user request with a bad gateway token");
        return Err(ApiError::Forbidden("Invalid gateway token".into()));
    }

    Ok(next.run(req).await)
}

/// Make sure a registered user can receive payloads before acting for them.
async fn connect(state: &AppState, user_id: UserId) -> Result<(), ApiError> {
    state.service.user(user_id).await?;
    state.mailboxes.ensure(user_id);
    Ok(())
}

async fn start(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(registration): Json<Registration>,
) -> Result<(StatusCode, Json<ProfileView>), ApiError> {
    state.service.register(user_id, &registration).await?;
    state.mailboxes.ensure(user_id);
    Ok((StatusCode::CREATED, Json(state.service.profile(user_id).await?)))
}

async fn profile(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<ProfileView>, ApiError> {
    Ok(Json(state.service.profile(user_id).await?))
}

async fn update_settings(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(settings): Json<SettingsUpdate>,
) -> Result<Json<ProfileView>, ApiError> {
    state.service.update_settings(user_id, &settings).await?;
    Ok(Json(state.service.profile(user_id).await?))
}

async fn search(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<SearchOutcome>, ApiError> {
    connect(&state, user_id).await?;
    Ok(Json(state.service.find_partner(user_id).await?))
}

async fn cancel_search(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Json<serde_json::Value> {
    let cancelled = state.service.cancel_search(user_id).await;
    Json(serde_json::json!({ "cancelled": cancelled }))
}

async fn active_session(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<ActiveSessionResponse>, ApiError> {
    let session = state.service.find_active_session(user_id).await?;
    Ok(Json(ActiveSessionResponse {
        session_id: session.session_id,
        started_at: session.started_at,
        message_count: session.message_count,
        last_activity_at: session.last_activity_at,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(content): Json<Content>,
) -> Result<Json<RelayReceipt>, ApiError> {
    if !state.relay_limiter.check(user_id).await {
        warn!(user = %user_id, "Relay rate limit exceeded");
        return Err(ApiError::RateLimited);
    }
    connect(&state, user_id).await?;
    Ok(Json(state.service.relay(user_id, content).await?))
}

async fn skip(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<SkipResponse>, ApiError> {
    connect(&state, user_id).await?;
    let outcome = state.service.skip(user_id).await?;
    Ok(Json(SkipResponse {
        ended: SessionResponse::from(&outcome.ended),
        search: outcome.search,
    }))
}

async fn end(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<SessionResponse>, ApiError> {
    let outcome = state.service.end(user_id).await?;
    Ok(Json(SessionResponse::from(&outcome)))
}

async fn block_partner(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<SessionResponse>, ApiError> {
    let outcome = state.service.block_partner(user_id).await?;
    Ok(Json(SessionResponse::from(&outcome)))
}

async fn report_partner(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    body: Option<Json<ReportRequest>>,
) -> Result<Json<SessionResponse>, ApiError> {
    let reason = body.and_then(|Json(req)| req.reason);
    let outcome = state
        .service
        .report_partner(user_id, reason.as_deref())
        .await?;
    Ok(Json(SessionResponse::from(&outcome)))
}

async fn disconnect(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<SessionResponse>, ApiError> {
    let outcome = state.service.disconnect(user_id).await?;
    state.mailboxes.close(user_id);
    Ok(Json(SessionResponse::from(&outcome)))
}

async fn blocked_list(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Vec<AnonId>>, ApiError> {
    Ok(Json(state.service.blocked_list(user_id).await?))
}

async fn block_by_anon(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blocked = state.service.block(user_id, &req.anon_id).await?;
    Ok(Json(serde_json::json!({ "blocked": blocked })))
}

async fn updates(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<Vec<Outbound>>, ApiError> {
    connect(&state, user_id).await?;
    let wait = Duration::from_secs(query.wait_secs.unwrap_or(0).min(MAX_POLL_WAIT_SECS));
    let limit = query.limit.unwrap_or(MAX_POLL_BATCH).clamp(1, MAX_POLL_BATCH);
    Ok(Json(state.mailboxes.poll(user_id, wait, limit).await))
}

async fn complete_challenge(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<MonetizeState>, ApiError> {
    connect(&state, user_id).await?;
    let monetize = match (req.token, req.deep_link) {
        (Some(token), _) => state.service.complete_challenge(user_id, token).await?,
        (None, Some(payload)) => state.service.complete_deep_link(user_id, &payload).await?,
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Expected `token` or `deep_link`".to_string(),
            ))
        }
    };
    Ok(Json(monetize))
}

// ---------------------------------------------------------------------------
// Admin routes
// ---------------------------------------------------------------------------

fn tokens_match(presented: &str, expected: &str) -> bool {
    use subtle::ConstantTimeEq;
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    presented.len() == expected.len() && presented.ct_eq(expected).unwrap_u8() == 1
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ApiError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ApiError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    if !tokens_match(token, expected) {
        return Err(ApiError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_stats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatsResponse>, ApiError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatsResponse {
        stats: state.service.stats().await,
        open_mailboxes: state.mailboxes.open_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

async fn admin_config(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<CoreConfig>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.service.config()))
}

async fn admin_update_config(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<CoreConfig>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    patch.validate()?;

    Ok(Json(state.service.update_config(|config| patch.apply(config))))
}

async fn admin_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserProfile>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.service.user(user_id).await?))
}

async fn admin_ban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserProfile>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    let profile = state.service.ban(user_id).await?;
    info!(user = %user_id, "Admin banned user");
    Ok(Json(profile))
}

async fn admin_unban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserProfile>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    let profile = state.service.unban(user_id).await?;
    info!(user = %user_id, "Admin unbanned user");
    Ok(Json(profile))
}

async fn admin_warn(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    body: Option<Json<WarnRequest>>,
) -> Result<Json<WarnOutcome>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    let reason = body.and_then(|Json(req)| req.reason);
    let outcome = state.service.warn(user_id, reason.as_deref()).await?;
    info!(user = %user_id, count = outcome.warning_count, banned = outcome.banned, "Admin warned user");
    Ok(Json(outcome))
}

async fn admin_monetize_override(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(req): Json<MonetizeOverrideRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(
        state
            .service
            .set_monetize_override(user_id, req.enabled)
            .await?,
    ))
}

async fn admin_reports(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<ReportsQuery>,
) -> Result<Json<Vec<Report>>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.service.list_reports(query.status).await?))
}

async fn admin_review_report(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    body: Option<Json<ReviewRequest>>,
) -> Result<Json<Report>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    let notes = body.and_then(|Json(req)| req.admin_notes);
    Ok(Json(
        state
            .service
            .review_report(&ReportId::new(report_id), notes)
            .await?,
    ))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
