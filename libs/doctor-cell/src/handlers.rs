// libs/doctor-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_models::auth::Actor;
use shared_models::clinic::Role;
use shared_models::error::AppError;
use shared_utils::extractor::require_role;

use crate::models::{
    CreateSpecialtyRequest, DoctorSearchQuery, RegisterDoctorRequest, SetDoctorStateRequest,
    UpdateAvailabilityRequest,
};
use crate::services::DoctorService;

pub struct DoctorCellState {
    pub config: Arc<AppConfig>,
    pub doctors: DoctorService<SqliteStore>,
}

impl DoctorCellState {
    pub fn new(config: Arc<AppConfig>, recorder: AuditRecorder<SqliteStore>) -> Self {
        Self {
            config,
            doctors: DoctorService::new(recorder),
        }
    }
}

// ==============================================================================
// DOCTOR HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn register_doctor(
    State(state): State<Arc<DoctorCellState>>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<RegisterDoctorRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_role(&actor, &[Role::Admin])?;

    let registration = state.doctors.register_doctor(&actor, request).await?;

    Ok((StatusCode::CREATED, Json(json!(registration))))
}

#[axum::debug_handler]
pub async fn list_doctors(
    State(state): State<Arc<DoctorCellState>>,
    Extension(_actor): Extension<Actor>,
    Query(query): Query<DoctorSearchQuery>,
) -> Result<Json<Value>, AppError> {
    let doctors = state.doctors.list_doctors(query.specialty_id).await?;

    Ok(Json(json!({
        "doctors": doctors,
        "total": doctors.len()
    })))
}

#[axum::debug_handler]
pub async fn get_doctor(
    State(state): State<Arc<DoctorCellState>>,
    Extension(_actor): Extension<Actor>,
    Path(doctor_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let doctor = state.doctors.get_doctor(doctor_id).await?;

    Ok(Json(json!(doctor)))
}

#[axum::debug_handler]
pub async fn set_doctor_state(
    State(state): State<Arc<DoctorCellState>>,
    Extension(actor): Extension<Actor>,
    Path(doctor_id): Path<i64>,
    Json(request): Json<SetDoctorStateRequest>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Admin])?;

    let doctor = state.doctors.set_doctor_state(&actor, doctor_id, request.state).await?;

    Ok(Json(json!(doctor)))
}

/// Admins, or the doctor editing their own schedule.
#[axum::debug_handler]
pub async fn update_availability(
    State(state): State<Arc<DoctorCellState>>,
    Extension(actor): Extension<Actor>,
    Path(doctor_id): Path<i64>,
    Json(request): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Value>, AppError> {
    if !actor.is_admin() {
        let doctor = state.doctors.get_doctor(doctor_id).await?;
        if actor.role != Role::Doctor || doctor.user_id != actor.user_id {
            return Err(AppError::Forbidden("Not authorized to edit this schedule".to_string()));
        }
    }

    let doctor = state
        .doctors
        .update_availability(&actor, doctor_id, request.availability)
        .await?;

    Ok(Json(json!(doctor)))
}

// ==============================================================================
// SPECIALTY HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_specialty(
    State(state): State<Arc<DoctorCellState>>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreateSpecialtyRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_role(&actor, &[Role::Admin])?;

    let specialty = state.doctors.create_specialty(&actor, request).await?;

    Ok((StatusCode::CREATED, Json(json!(specialty))))
}

#[axum::debug_handler]
pub async fn list_specialties(
    State(state): State<Arc<DoctorCellState>>,
    Extension(_actor): Extension<Actor>,
) -> Result<Json<Value>, AppError> {
    let specialties = state.doctors.list_specialties().await?;

    Ok(Json(json!({
        "specialties": specialties,
        "total": specialties.len()
    })))
}
