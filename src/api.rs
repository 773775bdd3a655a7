// src/api.rs
//! JSON HTTP surface: status, audit, history, lookups and operator actions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shuttle_axum::axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::audit;
use crate::error::{CycleError, LedgerError};
use crate::model::{ChangeStats, Origin, PatternKey, PatternKind, VersionId};
use crate::parse::normalize_domain;
use crate::orchestrator::OrchestratorHandle;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;
/// Audit range when `from` is omitted.
const DEFAULT_AUDIT_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
}

impl AppState {
    pub fn new(orchestrator: OrchestratorHandle) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .route("/audit", get(audit_export))
        .route("/history", get(history))
        .route("/history/pattern", get(pattern_history))
        .route("/diff", get(diff))
        .route("/lookup", get(lookup))
        .route("/match/url", post(match_url))
        .route("/match/css", post(match_css))
        .route("/admin/rollback", post(admin_rollback))
        .route("/admin/emergency-stop", post(admin_emergency_stop))
        .route("/admin/emergency-clear", post(admin_emergency_clear))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_ts(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| error(StatusCode::BAD_REQUEST, format!("invalid `{field}`: {e}")))
    })
    .transpose()
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

#[derive(Deserialize)]
struct AuditQuery {
    from: Option<String>,
    to: Option<String>,
}

async fn audit_export(State(state): State<AppState>, Query(q): Query<AuditQuery>) -> Response {
    let to = match parse_ts("to", q.to.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(resp) => return resp,
    };
    let from = match parse_ts("from", q.from.as_deref()) {
        Ok(f) => f.unwrap_or(to - Duration::hours(DEFAULT_AUDIT_HOURS)),
        Err(resp) => return resp,
    };
    if from > to {
        return error(StatusCode::BAD_REQUEST, "`from` is after `to`");
    }
    Json(audit::export(state.orchestrator.ledger(), from, to)).into_response()
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    before: Option<u64>,
}

#[derive(Serialize)]
struct VersionOut {
    id: VersionId,
    parent: Option<VersionId>,
    timestamp: DateTime<Utc>,
    origin: Origin,
    message: String,
    reverts: Option<VersionId>,
    restores: Option<VersionId>,
    stats: ChangeStats,
    pattern_count: usize,
}

async fn history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let rows: Vec<VersionOut> = state
        .orchestrator
        .ledger()
        .history(limit, q.before.map(VersionId))
        .into_iter()
        .map(|v| VersionOut {
            id: v.id,
            parent: v.parent,
            timestamp: v.timestamp,
            origin: v.origin,
            message: v.message.clone(),
            reverts: v.reverts,
            restores: v.restores,
            stats: v.stats,
            pattern_count: v.pattern_count(),
        })
        .collect();
    Json(rows).into_response()
}

#[derive(Deserialize)]
struct PatternHistoryQuery {
    kind: Option<PatternKind>,
    pattern: String,
    limit: Option<usize>,
}

async fn pattern_history(
    State(state): State<AppState>,
    Query(q): Query<PatternHistoryQuery>,
) -> Response {
    let kind = q.kind.unwrap_or(PatternKind::Domain);
    let pattern = match kind {
        PatternKind::Domain => normalize_domain(&q.pattern),
        _ => Some(q.pattern.clone()).filter(|p| !p.is_empty()),
    };
    let Some(pattern) = pattern else {
        return error(StatusCode::BAD_REQUEST, "invalid `pattern`");
    };
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let trail = state
        .orchestrator
        .ledger()
        .pattern_history(&PatternKey::new(kind, pattern), limit);
    Json(trail).into_response()
}

#[derive(Deserialize)]
struct DiffQuery {
    from: u64,
    to: u64,
}

async fn diff(State(state): State<AppState>, Query(q): Query<DiffQuery>) -> Response {
    match state
        .orchestrator
        .ledger()
        .diff(VersionId(q.from), VersionId(q.to))
    {
        Ok(d) => Json(d).into_response(),
        Err(e @ LedgerError::NotFound(_)) => error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct LookupQuery {
    domain: String,
}

async fn lookup(State(state): State<AppState>, Query(q): Query<LookupQuery>) -> Response {
    let hit = state.orchestrator.engine().lookup(&q.domain);
    Json(json!({
        "domain": q.domain,
        "tracker": hit.is_some(),
        "match": hit,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct UrlReq {
    url: String,
}

async fn match_url(State(state): State<AppState>, Json(body): Json<UrlReq>) -> Response {
    Json(state.orchestrator.engine().match_url(&body.url)).into_response()
}

#[derive(Deserialize)]
struct CssReq {
    fragment: String,
}

async fn match_css(State(state): State<AppState>, Json(body): Json<CssReq>) -> Response {
    Json(state.orchestrator.engine().match_css(&body.fragment)).into_response()
}

#[derive(Deserialize)]
struct RollbackReq {
    target: u64,
}

async fn admin_rollback(State(state): State<AppState>, Json(body): Json<RollbackReq>) -> Response {
    let target = VersionId(body.target);
    match state.orchestrator.rollback(target).await {
        Ok(id) => {
            tracing::warn!(target: "api", rollback = id.0, restored = target.0, "manual rollback");
            Json(json!({ "version": id, "restored": target })).into_response()
        }
        Err(e @ CycleError::RollbackTargetMissing(_)) => error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ CycleError::Stopped) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct EmergencyReq {
    #[serde(default)]
    reason: Option<String>,
}

async fn admin_emergency_stop(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    // body is optional
    let reason = serde_json::from_slice::<EmergencyReq>(&body)
        .ok()
        .and_then(|b| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual emergency stop".into());
    state.orchestrator.emergency_stop(reason.clone());
    Json(json!({ "state": state.orchestrator.state(), "reason": reason })).into_response()
}

async fn admin_emergency_clear(State(state): State<AppState>) -> Response {
    let cleared = state.orchestrator.clear_emergency();
    Json(json!({ "state": state.orchestrator.state(), "cleared": cleared })).into_response()
}
