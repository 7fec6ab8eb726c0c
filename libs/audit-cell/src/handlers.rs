use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_models::auth::Actor;
use shared_models::clinic::Role;
use shared_models::error::AppError;
use shared_utils::extractor::require_role;

use crate::models::parse_table;
use crate::services::{AuditQueryService, AuditRetryHandle};

pub struct AuditState {
    pub config: Arc<AppConfig>,
    pub queries: AuditQueryService<SqliteStore>,
    pub retry: AuditRetryHandle,
}

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    pub threshold: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PreviousStateQuery {
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct DateRangeQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

fn admin_only(actor: &Actor) -> Result<(), AppError> {
    require_role(actor, &[Role::Admin])
}

// ==============================================================================
// AUDIT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn get_trail(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path((table, record_id)): Path<(String, i64)>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;
    let table = parse_table(&table)?;

    let trail = state.queries.get_trail(table, record_id).await?;

    Ok(Json(json!({
        "table": table,
        "record_id": record_id,
        "total": trail.len(),
        "trail": trail
    })))
}

#[axum::debug_handler]
pub async fn get_recent(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path(table): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;
    let table = parse_table(&table)?;

    let records = state.queries.get_recent(table, query.limit).await?;

    Ok(Json(json!({
        "table": table,
        "total": records.len(),
        "records": records
    })))
}

#[axum::debug_handler]
pub async fn get_changes(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path((table, record_id)): Path<(String, i64)>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;
    let table = parse_table(&table)?;

    let changes = state.queries.get_changes(table, record_id).await?;

    Ok(Json(json!({
        "table": table,
        "record_id": record_id,
        "changes": changes
    })))
}

#[axum::debug_handler]
pub async fn get_by_actor(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;

    let records = state.queries.get_by_actor(user_id, query.limit).await?;

    Ok(Json(json!({
        "user_id": user_id,
        "total": records.len(),
        "records": records
    })))
}

#[axum::debug_handler]
pub async fn detect_anomalies(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<AnomalyQuery>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;
    let threshold = query.threshold.unwrap_or(state.config.anomaly_threshold);

    let anomalies = state.queries.detect_anomalies(threshold).await?;

    Ok(Json(json!({
        "threshold": threshold,
        "window_hours": crate::services::query::ANOMALY_WINDOW_HOURS,
        "anomalies": anomalies
    })))
}

#[axum::debug_handler]
pub async fn get_stats(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;

    let stats = state.queries.get_stats().await?;

    Ok(Json(json!(stats)))
}

#[axum::debug_handler]
pub async fn get_previous_state(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path((table, record_id)): Path<(String, i64)>,
    Query(query): Query<PreviousStateQuery>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;
    let table = parse_table(&table)?;

    let previous = state
        .queries
        .get_previous_state(table, record_id, query.before)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No earlier state recorded for {} {}", table, record_id)))?;

    Ok(Json(json!(previous)))
}

#[axum::debug_handler]
pub async fn get_by_date_range(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path(table): Path<String>,
    Query(query): Query<DateRangeQuery>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;
    let table = parse_table(&table)?;

    let records = state.queries.get_by_date_range(table, query.from, query.to).await?;

    Ok(Json(json!({
        "table": table,
        "from": query.from,
        "to": query.to,
        "total": records.len(),
        "records": records
    })))
}

#[axum::debug_handler]
pub async fn get_appointment_summary(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;

    let summary = state.queries.get_appointment_summary(appointment_id).await?;
    if summary.trail.is_empty() {
        return Err(AppError::NotFound(format!("No audit history for appointment {}", appointment_id)));
    }

    Ok(Json(json!(summary)))
}

#[axum::debug_handler]
pub async fn get_dead_letters(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;

    let letters = state.retry.dead_letters();

    Ok(Json(json!({
        "pending_retries": state.retry.pending(),
        "total": letters.len(),
        "dead_letters": letters
    })))
}

#[axum::debug_handler]
pub async fn validate_audit_log(
    State(state): State<Arc<AuditState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Value>, AppError> {
    admin_only(&actor)?;

    let report = state.queries.validate(&state.retry).await?;

    Ok(Json(json!(report)))
}
