// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_models::auth::Actor;
use shared_models::clinic::{Appointment, Role};
use shared_models::error::AppError;
use shared_utils::extractor::require_role;

use crate::models::{
    AppointmentSearchQuery, AttachFileRequest, BookAppointmentRequest, CreatePaymentRequest,
    PaymentStatusReport, ReassignDoctorRequest, UpdateNotesRequest,
};
use crate::services::{AttachmentService, ConsistencyChecker, PaymentService, SchedulingEngine};

pub struct AppointmentCellState {
    pub config: Arc<AppConfig>,
    pub engine: SchedulingEngine<SqliteStore>,
    pub payments: PaymentService<SqliteStore>,
    pub attachments: AttachmentService<SqliteStore>,
    pub consistency: ConsistencyChecker<SqliteStore>,
}

impl AppointmentCellState {
    pub fn new(config: Arc<AppConfig>, recorder: AuditRecorder<SqliteStore>) -> Self {
        Self {
            engine: SchedulingEngine::new(recorder.clone(), &config),
            payments: PaymentService::new(recorder.clone(), &config),
            attachments: AttachmentService::new(recorder.clone(), &config),
            consistency: ConsistencyChecker::new(recorder.store().clone()),
            config,
        }
    }
}

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub reason: Option<String>,
}

// ==============================================================================
// ACCESS HELPERS
// ==============================================================================

/// Admins act for anyone; patients and doctors only for their own records.
async fn ensure_acting_for(
    state: &AppointmentCellState,
    actor: &Actor,
    patient_id: i64,
    doctor_id: i64,
) -> Result<(), AppError> {
    let allowed = match actor.role {
        Role::Admin => true,
        Role::Patient => state.engine.find_patient(patient_id).await?.user_id == actor.user_id,
        Role::Doctor => state.engine.find_doctor(doctor_id).await?.user_id == actor.user_id,
    };

    if !allowed {
        return Err(AppError::Forbidden("Not authorized for this appointment".to_string()));
    }
    Ok(())
}

async fn ensure_participant(
    state: &AppointmentCellState,
    actor: &Actor,
    appointment: &Appointment,
) -> Result<(), AppError> {
    ensure_acting_for(state, actor, appointment.patient_id, appointment.doctor_id).await
}

async fn load_for(state: &AppointmentCellState, actor: &Actor, appointment_id: i64) -> Result<Appointment, AppError> {
    let appointment = state.engine.get(appointment_id).await?;
    ensure_participant(state, actor, &appointment).await?;
    Ok(appointment)
}

// ==============================================================================
// APPOINTMENT LIFECYCLE HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn book_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<BookAppointmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    ensure_acting_for(&state, &actor, request.patient_id, request.doctor_id).await?;

    let appointment = state.engine.book(&actor, request).await?;

    Ok((StatusCode::CREATED, Json(json!(appointment))))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let appointment = load_for(&state, &actor, appointment_id).await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<AppointmentSearchQuery>,
) -> Result<Json<Value>, AppError> {
    match actor.role {
        Role::Admin => {}
        Role::Patient => {
            let patient_id = query
                .patient_id
                .ok_or_else(|| AppError::BadRequest("patient_id is required".to_string()))?;
            if state.engine.find_patient(patient_id).await?.user_id != actor.user_id {
                return Err(AppError::Forbidden("Patients may only list their own appointments".to_string()));
            }
        }
        Role::Doctor => {
            let doctor_id = query
                .doctor_id
                .ok_or_else(|| AppError::BadRequest("doctor_id is required".to_string()))?;
            if state.engine.find_doctor(doctor_id).await?.user_id != actor.user_id {
                return Err(AppError::Forbidden("Doctors may only list their own appointments".to_string()));
            }
        }
    }

    let appointments = state.engine.list(query).await?;

    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<Value>, AppError> {
    load_for(&state, &actor, appointment_id).await?;

    let appointment = state.engine.cancel(&actor, appointment_id, query.reason).await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn reassign_doctor(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
    Json(request): Json<ReassignDoctorRequest>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Admin])?;

    let appointment = state
        .engine
        .reassign(&actor, appointment_id, request.new_doctor_id)
        .await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn confirm_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Admin])?;

    let appointment = state.engine.confirm(&actor, appointment_id).await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn complete_appointment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Doctor, Role::Admin])?;
    load_for(&state, &actor, appointment_id).await?;

    let appointment = state.engine.complete(&actor, appointment_id).await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn update_notes(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
    Json(request): Json<UpdateNotesRequest>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Doctor, Role::Admin])?;
    load_for(&state, &actor, appointment_id).await?;

    let appointment = state
        .engine
        .update_notes(&actor, appointment_id, request.notes)
        .await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn check_consistency(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Admin])?;

    let report = state.consistency.check().await?;

    Ok(Json(json!(report)))
}

// ==============================================================================
// PAYMENT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_payment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    load_for(&state, &actor, appointment_id).await?;

    let payment = state.payments.create_payment(&actor, appointment_id, request).await?;

    Ok((StatusCode::CREATED, Json(json!(payment))))
}

#[axum::debug_handler]
pub async fn get_payment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    load_for(&state, &actor, appointment_id).await?;

    let payment = state.payments.get_payment(appointment_id).await?;

    Ok(Json(json!(payment)))
}

/// Gateway status callback, relayed by an administrator.
#[axum::debug_handler]
pub async fn report_payment_status(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
    Json(report): Json<PaymentStatusReport>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Admin])?;

    let payment = state.payments.report_status(&actor, appointment_id, report).await?;

    Ok(Json(json!(payment)))
}

// ==============================================================================
// ATTACHMENT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn attach_file(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
    Json(request): Json<AttachFileRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    load_for(&state, &actor, appointment_id).await?;

    let attachment = state.attachments.attach_file(&actor, appointment_id, request).await?;

    Ok((StatusCode::CREATED, Json(json!(attachment))))
}

#[axum::debug_handler]
pub async fn list_attachments(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    load_for(&state, &actor, appointment_id).await?;

    let attachments = state.attachments.list_attachments(appointment_id).await?;

    Ok(Json(json!({
        "appointment_id": appointment_id,
        "attachments": attachments,
        "total": attachments.len()
    })))
}

#[axum::debug_handler]
pub async fn remove_attachment(
    State(state): State<Arc<AppointmentCellState>>,
    Extension(actor): Extension<Actor>,
    Path(attachment_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let attachment = state.attachments.get_attachment(attachment_id).await?;
    load_for(&state, &actor, attachment.appointment_id).await?;

    state.attachments.remove_attachment(&actor, attachment_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Attachment {} removed", attachment_id)
    })))
}
