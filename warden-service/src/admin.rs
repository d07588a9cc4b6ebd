// Warden - tenant-aware admission control
// File: warden-service/src/admin.rs

//! Read-mostly admin HTTP surface: overview and tenant snapshots, denial
//! listings, CSV export, the two tenant mutators the configuration
//! collaborator uses, and the Prometheus scrape endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use warden_core::{DenialRecord, EnforcementConfig, TenantLimits, TenantRegistry};

use crate::metrics::WardenMetrics;

const DEFAULT_OVERVIEW_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_DENIALS_WINDOW: Duration = Duration::from_secs(60 * 60);
const CSV_EXPORT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<TenantRegistry>,
    pub metrics: Arc<WardenMetrics>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<ApiError>)>;

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/overview", get(overview))
        .route("/api/tenants", get(list_tenants))
        .route("/api/tenants/:id", get(tenant_detail))
        .route("/api/tenants/:id/limits", put(put_limits))
        .route("/api/tenants/:id/enforcement", post(post_enforcement))
        .route("/api/denials", get(list_denials))
        .route("/api/export/csv", get(export_csv))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

/// Parses window strings like `90s`, `15m`, `1h`, `24h`, `7d`, `1w`.
/// Bare digits are seconds.
fn parse_since(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b's' => (&raw[..raw.len() - 1], 1),
        b'm' => (&raw[..raw.len() - 1], 60),
        b'h' => (&raw[..raw.len() - 1], 3600),
        b'd' => (&raw[..raw.len() - 1], 86_400),
        b'w' => (&raw[..raw.len() - 1], 7 * 86_400),
        _ => (raw, 1),
    };
    let value: u64 = digits.parse().ok()?;
    Some(Duration::from_secs(value * multiplier))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<String>,
}

fn window_of(query: &SinceQuery, default: Duration) -> Result<Duration, (StatusCode, Json<ApiError>)> {
    match &query.since {
        None => Ok(default),
        Some(raw) => parse_since(raw)
            .ok_or_else(|| error(StatusCode::BAD_REQUEST, format!("invalid since {raw:?}"))),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn overview(State(state): State<AdminState>, Query(query): Query<SinceQuery>) -> ApiResult {
    let window = window_of(&query, DEFAULT_OVERVIEW_WINDOW)?;
    let overview = state.registry.overview(window);
    let allow_percentage = if overview.total_requests > 0 {
        round1(overview.allowed_requests as f64 * 100.0 / overview.total_requests as f64)
    } else {
        100.0
    };
    Ok(Json(json!({
        "stats": {
            "total_requests": overview.total_requests,
            "allowed_requests": overview.allowed_requests,
            "denied_requests": overview.denied_requests,
            "allow_percentage": allow_percentage,
            "active_tenants": overview.active_tenants,
        }
    })))
}

async fn list_tenants(State(state): State<AdminState>) -> ApiResult {
    Ok(Json(json!({ "tenants": state.registry.list() })))
}

async fn tenant_detail(State(state): State<AdminState>, Path(id): Path<String>) -> ApiResult {
    let tenant = state
        .registry
        .snapshot(&id)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("unknown tenant {id:?}")))?;
    let rates = state
        .registry
        .rates(&id, DEFAULT_OVERVIEW_WINDOW)
        .unwrap_or_default();
    let recent_denials = state
        .registry
        .recent_denials(Some(&id), DEFAULT_DENIALS_WINDOW);
    Ok(Json(json!({
        "tenant": tenant,
        "rates": {
            "rps": rates.rps,
            "samples_per_sec": rates.samples_per_sec,
            "allow_rate": rates.allow_rate,
            "deny_rate": rates.deny_rate,
            "utilization_pct": round1(rates.utilization * 100.0),
        },
        "recent_denials": recent_denials,
    })))
}

async fn put_limits(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(limits): Json<TenantLimits>,
) -> ApiResult {
    state.registry.set_limits(&id, limits);
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct EnforcementQuery {
    enabled: Option<bool>,
    #[serde(rename = "burstPctOverride")]
    burst_pct_override: Option<f64>,
}

async fn post_enforcement(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<EnforcementQuery>,
) -> ApiResult {
    let current = state.registry.get_or_create(&id).policy().1;
    state.registry.set_enforcement(
        &id,
        EnforcementConfig {
            enabled: query.enabled.unwrap_or(current.enabled),
            burst_pct_override: query.burst_pct_override.or(current.burst_pct_override),
        },
    );
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct DenialsQuery {
    tenant: Option<String>,
    since: Option<String>,
}

async fn list_denials(
    State(state): State<AdminState>,
    Query(query): Query<DenialsQuery>,
) -> ApiResult {
    let window = window_of(
        &SinceQuery {
            since: query.since.clone(),
        },
        DEFAULT_DENIALS_WINDOW,
    )?;
    let denials = state
        .registry
        .recent_denials(query.tenant.as_deref(), window);
    Ok(Json(json!({ "denials": denials })))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(records: &[DenialRecord]) -> String {
    let mut out = String::from("tenant,reason,timestamp,samples,body_bytes\n");
    for record in records {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_field(&record.tenant_id),
            record.reason.as_str(),
            record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            record.observed_samples,
            record.observed_body_bytes,
        ));
    }
    out
}

async fn export_csv(State(state): State<AdminState>) -> impl IntoResponse {
    let records = state.registry.recent_denials(None, CSV_EXPORT_WINDOW);
    (
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        render_csv(&records),
    )
}

async fn metrics_text(
    State(state): State<AdminState>,
) -> Result<String, (StatusCode, Json<ApiError>)> {
    state.metrics.tenants.set(state.registry.tenant_count() as i64);
    state
        .metrics
        .gather()
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
