use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, AuditState};
use crate::services::{AuditQueryService, AuditRecorder};

pub fn audit_routes(config: Arc<AppConfig>, recorder: &AuditRecorder<SqliteStore>) -> Router {
    let state = Arc::new(AuditState {
        config: config.clone(),
        queries: AuditQueryService::new(recorder.store().clone()),
        retry: recorder.retry_handle().clone(),
    });

    // Every audit read is admin-only; handlers check the role
    Router::new()
        .route("/recent/{table}", get(handlers::get_recent))
        .route("/changes/{table}/{record_id}", get(handlers::get_changes))
        .route("/user/{user_id}", get(handlers::get_by_actor))
        .route("/anomalies", get(handlers::detect_anomalies))
        .route("/stats", get(handlers::get_stats))
        .route("/previous/{table}/{record_id}", get(handlers::get_previous_state))
        .route("/range/{table}", get(handlers::get_by_date_range))
        .route("/appointment/{appointment_id}", get(handlers::get_appointment_summary))
        .route("/dead-letters", get(handlers::get_dead_letters))
        .route("/validate", get(handlers::validate_audit_log))
        .route("/{table}/{record_id}", get(handlers::get_trail))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(state)
}
