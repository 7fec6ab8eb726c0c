use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use appointment_cell::router::appointment_routes;
use audit_cell::router::audit_routes;
use audit_cell::AuditRecorder;
use doctor_cell::router::{doctor_routes, specialty_routes};
use patient_cell::router::create_patient_router;
use shared_config::AppConfig;
use shared_database::SqliteStore;

pub fn create_router(config: Arc<AppConfig>, recorder: &AuditRecorder<SqliteStore>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic API is running!" }))
        .nest("/appointments", appointment_routes(config.clone(), recorder))
        .nest("/audit", audit_routes(config.clone(), recorder))
        .nest("/doctors", doctor_routes(config.clone(), recorder))
        .nest("/specialties", specialty_routes(config.clone(), recorder))
        .nest("/patients", create_patient_router(config, recorder))
}
