use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post, put},
    Router,
};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_utils::extractor::auth_middleware;

use crate::handlers::*;

pub fn create_patient_router(config: Arc<AppConfig>, recorder: &AuditRecorder<SqliteStore>) -> Router {
    let state = Arc::new(PatientCellState::new(config.clone(), recorder.clone()));

    Router::new()
        .route("/", post(register_patient).get(list_patients))
        .route("/{id}", get(get_patient))
        .route("/{id}/medical", patch(update_medical_profile))
        .route("/{id}/federated-identity", put(link_federated_identity))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(state)
}
