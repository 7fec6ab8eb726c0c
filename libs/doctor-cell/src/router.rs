// libs/doctor-cell/src/router.rs
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

use crate::handlers::{self, DoctorCellState};

pub fn doctor_routes(config: Arc<AppConfig>, recorder: &AuditRecorder<SqliteStore>) -> Router {
    let state = Arc::new(DoctorCellState::new(config.clone(), recorder.clone()));

    Router::new()
        .route("/", post(handlers::register_doctor).get(handlers::list_doctors))
        .route("/{doctor_id}", get(handlers::get_doctor))
        .route("/{doctor_id}/state", patch(handlers::set_doctor_state))
        .route("/{doctor_id}/availability", put(handlers::update_availability))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(state)
}

pub fn specialty_routes(config: Arc<AppConfig>, recorder: &AuditRecorder<SqliteStore>) -> Router {
    let state = Arc::new(DoctorCellState::new(config.clone(), recorder.clone()));

    Router::new()
        .route("/", post(handlers::create_specialty).get(handlers::list_specialties))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(state)
}
