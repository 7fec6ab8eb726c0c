// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, AppointmentCellState};

pub fn appointment_routes(config: Arc<AppConfig>, recorder: &AuditRecorder<SqliteStore>) -> Router {
    let state = Arc::new(AppointmentCellState::new(config.clone(), recorder.clone()));

    // All appointment operations require authentication
    Router::new()
        .route("/", post(handlers::book_appointment).get(handlers::list_appointments))
        .route("/consistency", get(handlers::check_consistency)) // Admin only
        .route("/{appointment_id}", get(handlers::get_appointment).delete(handlers::cancel_appointment))
        .route("/{appointment_id}/doctor", patch(handlers::reassign_doctor))
        .route("/{appointment_id}/confirm", patch(handlers::confirm_appointment))
        .route("/{appointment_id}/complete", patch(handlers::complete_appointment))
        .route("/{appointment_id}/notes", patch(handlers::update_notes))
        // Payment gateway collaborator
        .route(
            "/{appointment_id}/payment",
            post(handlers::create_payment)
                .get(handlers::get_payment)
                .patch(handlers::report_payment_status),
        )
        .route(
            "/{appointment_id}/attachments",
            post(handlers::attach_file).get(handlers::list_attachments),
        )
        .route("/attachments/{attachment_id}", delete(handlers::remove_attachment))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(state)
}
