//! Router assembly, middleware, and handlers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, extract::Request};
use maren_broker::keys;
use maren_core::{InteractionId, RecoveryTrigger, ReviewerId, UserId, clock};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;
use uuid::Uuid;

use crate::dto::{
    ApproveRequest, CustomerStatusRequest, NicknameRequest, NotesRequest, ProfileRequest,
    RejectRequest,
};
use crate::error::{ApiError, ApiResult};
use crate::state::ApiState;

/// Rate-limit counters expire after two minute-buckets.
const RATE_WINDOW_TTL: std::time::Duration = std::time::Duration::from_secs(120);

/// Build the reviewer API router.
#[must_use]
pub fn router(state: ApiState) -> Router {
    let cors = build_cors(&state);
    Router::new()
        .route("/reviews/pending", get(list_pending))
        .route("/reviews/{id}/claim", post(claim))
        .route("/reviews/{id}/approve", post(approve))
        .route("/reviews/{id}/reject", post(reject))
        .route("/interactions/{id}", get(get_interaction))
        .route("/interactions/{id}/reviewer-notes", post(set_notes))
        .route(
            "/users/{user_id}/customer-status",
            get(get_customer_status).post(set_customer_status),
        )
        .route("/users/{user_id}/nickname", post(set_nickname))
        .route("/protocol/{user_id}", get(get_protocol))
        .route("/protocol/{user_id}/activate", post(activate_protocol))
        .route("/protocol/{user_id}/deactivate", post(deactivate_protocol))
        .route("/quarantine/messages", get(quarantine_messages))
        .route("/quarantine/{entry_id}/release", post(release_quarantine))
        .route("/recovery/status", get(recovery_status))
        .route("/recovery/trigger", post(recovery_trigger))
        .route("/recovery/history", get(recovery_history))
        .route("/models/profiles", get(model_profiles))
        .route("/models/profile", post(switch_profile))
        .route("/models/current", get(current_model))
        // Layers added later wrap the ones before them, so the limiter goes
        // last: it must run before auth and count every request, including
        // bad-token probes.
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(state)
}

fn build_cors(state: &ApiState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .resources
        .config
        .review
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-reviewer"),
        ])
}

/// Bearer-token check against the configured secret.
async fn auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.resources.config.review.auth_token.as_deref() else {
        warn!("review API has no auth token configured; refusing request");
        return Err(ApiError::Unauthorized);
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if constant_time_eq(token, expected) => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Length-safe comparison; avoids early-exit on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Per-IP, per-minute request budget on broker counters.
async fn rate_limit(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .unwrap_or("local")
        .trim()
        .to_owned();
    let minute = clock::now_utc().timestamp() / 60;
    let count = state
        .resources
        .broker
        .incr(&keys::rate_limit(&ip, minute), Some(RATE_WINDOW_TTL));
    if count > i64::from(state.resources.config.review.rate_limit_per_minute) {
        return Err(ApiError::RateLimited);
    }
    Ok(next.run(request).await)
}

/// The standard security headers, on every response.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

fn reviewer_from(headers: &HeaderMap) -> ApiResult<ReviewerId> {
    headers
        .get("x-reviewer")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(|value| ReviewerId::new(value.trim()))
        .ok_or_else(|| ApiError::Validation("missing X-Reviewer header".into()))
}

fn interaction_id(raw: &str) -> ApiResult<InteractionId> {
    raw.parse::<Uuid>()
        .map(InteractionId::from_uuid)
        .map_err(|_| ApiError::Validation("bad interaction id".into()))
}

// ---------------------------------------------------------------------------
// Reviews
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PendingQuery {
    limit: Option<usize>,
    cursor: Option<String>,
}

async fn list_pending(
    State(state): State<ApiState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<impl IntoResponse> {
    let response = state
        .review
        .list_pending(query.limit.unwrap_or(50), query.cursor.as_deref())
        .await?;
    Ok(Json(response))
}

async fn claim(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let reviewer = reviewer_from(&headers)?;
    state.review.claim(interaction_id(&id)?, &reviewer).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<impl IntoResponse> {
    let reviewer = reviewer_from(&headers)?;
    let interaction = state
        .review
        .approve(interaction_id(&id)?, &reviewer, &request)
        .await?;
    Ok(Json(interaction))
}

async fn reject(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RejectRequest>,
) -> ApiResult<impl IntoResponse> {
    let reviewer = reviewer_from(&headers)?;
    if request.reason.trim().is_empty() {
        return Err(ApiError::Validation("reason must not be empty".into()));
    }
    let interaction = state
        .review
        .reject(interaction_id(&id)?, &reviewer, &request.reason)
        .await?;
    Ok(Json(interaction))
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

async fn get_interaction(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let interaction = state
        .resources
        .store
        .get_interaction(interaction_id(&id)?)
        .await?;
    Ok(Json(interaction))
}

async fn set_notes(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<NotesRequest>,
) -> ApiResult<impl IntoResponse> {
    let escaped = request.validate()?;
    state
        .resources
        .store
        .update_reviewer_notes(interaction_id(&id)?, &escaped)
        .await?;
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

async fn get_customer_status(
    State(state): State<ApiState>,
    Path(user_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let user = state.resources.store.get_user(UserId(user_id)).await?;
    Ok(Json(json!({
        "user_id": user.id,
        "nickname": user.nickname,
        "customer_status": user.customer_status,
        "lifetime_value": user.lifetime_value,
    })))
}

async fn set_customer_status(
    State(state): State<ApiState>,
    Path(user_id): Path<i64>,
    Json(request): Json<CustomerStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    if !(0.0..=1.0).contains(&request.lifetime_value) {
        return Err(ApiError::Validation(
            "lifetime_value must be in [0, 1]".into(),
        ));
    }
    state
        .resources
        .store
        .set_customer_status(
            UserId(user_id),
            request.customer_status.as_deref(),
            request.lifetime_value,
            clock::now_utc(),
        )
        .await?;
    Ok(Json(json!({"ok": true})))
}

async fn set_nickname(
    State(state): State<ApiState>,
    Path(user_id): Path<i64>,
    Json(request): Json<NicknameRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.nickname.trim().is_empty() {
        return Err(ApiError::Validation("nickname must not be empty".into()));
    }
    state
        .resources
        .store
        .set_nickname(UserId(user_id), request.nickname.trim(), clock::now_utc())
        .await?;
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Protocol & quarantine
// ---------------------------------------------------------------------------

async fn get_protocol(
    State(state): State<ApiState>,
    Path(user_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let protocol = state
        .resources
        .store
        .protocol_state(UserId(user_id))
        .await?;
    Ok(Json(protocol))
}

async fn activate_protocol(
    State(state): State<ApiState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let reviewer = reviewer_from(&headers)?;
    state.protocol.activate(UserId(user_id), &reviewer).await?;
    Ok(Json(json!({"ok": true, "active": true})))
}

async fn deactivate_protocol(
    State(state): State<ApiState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let reviewer = reviewer_from(&headers)?;
    state.protocol.deactivate(UserId(user_id), &reviewer).await?;
    Ok(Json(json!({"ok": true, "active": false})))
}

#[derive(Deserialize)]
struct QuarantineQuery {
    user_id: i64,
    limit: Option<i64>,
}

async fn quarantine_messages(
    State(state): State<ApiState>,
    Query(query): Query<QuarantineQuery>,
) -> ApiResult<impl IntoResponse> {
    let entries = state
        .protocol
        .quarantine_queue(UserId(query.user_id), query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({"entries": entries})))
}

async fn release_quarantine(
    State(state): State<ApiState>,
    Path(entry_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let entry_id = entry_id
        .parse()
        .map_err(|_| ApiError::Validation("bad quarantine entry id".into()))?;
    let entry = state.protocol.release(entry_id).await?;
    Ok(Json(json!({
        "ok": true,
        "user_id": entry.user_id,
        "platform_message_id": entry.platform_message_id,
    })))
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

async fn recovery_status(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let latest = state.resources.store.latest_recovery_op().await?;
    Ok(Json(json!({
        "running": state.recovery.is_running(),
        "breaker_open_secs": state.recovery.breaker_open_for().await,
        "latest": latest,
    })))
}

async fn recovery_trigger(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    if state.recovery.is_running() {
        return Err(ApiError::Conflict("a recovery pass is already running".into()));
    }
    if let Some(retry_after_secs) = state.recovery.breaker_open_for().await {
        return Err(ApiError::CircuitOpen { retry_after_secs });
    }
    let recovery = state.recovery.clone();
    tokio::spawn(async move {
        if let Err(err) = recovery.run(RecoveryTrigger::Manual).await {
            warn!(%err, "manual recovery failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "started"}))))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn recovery_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let history = state
        .resources
        .store
        .recovery_history(query.limit.unwrap_or(20).clamp(1, 200))
        .await?;
    Ok(Json(json!({"operations": history})))
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

async fn model_profiles(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({
        "profiles": state.resources.router.profile_names(),
    })))
}

async fn switch_profile(
    State(state): State<ApiState>,
    Json(request): Json<ProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    state.resources.router.switch_profile(&request.name).await?;
    Ok(Json(json!({"ok": true, "profile": request.name})))
}

async fn current_model(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({
        "profile": state.resources.router.current_profile().await,
        "degraded": state.resources.router.is_degraded(),
    })))
}
