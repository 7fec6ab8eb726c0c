use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::SqliteStore;
use shared_models::auth::Actor;
use shared_models::clinic::{Patient, Role};
use shared_models::error::AppError;
use shared_utils::extractor::require_role;

use crate::models::{LinkFederatedIdentityRequest, RegisterPatientRequest, UpdateMedicalProfileRequest};
use crate::services::PatientService;

pub struct PatientCellState {
    pub config: Arc<AppConfig>,
    pub patients: PatientService<SqliteStore>,
}

impl PatientCellState {
    pub fn new(config: Arc<AppConfig>, recorder: AuditRecorder<SqliteStore>) -> Self {
        Self {
            config,
            patients: PatientService::new(recorder),
        }
    }
}

/// Admins and doctors see any patient; a patient sees only their own record.
async fn load_visible(state: &PatientCellState, actor: &Actor, patient_id: i64) -> Result<Patient, AppError> {
    let patient = state.patients.get_patient(patient_id).await?;
    if actor.role == Role::Patient && patient.user_id != actor.user_id {
        return Err(AppError::Forbidden("Patients may only access their own record".to_string()));
    }
    Ok(patient)
}

/// Admins, or the patient themself.
async fn ensure_owner_or_admin(state: &PatientCellState, actor: &Actor, patient_id: i64) -> Result<(), AppError> {
    if actor.is_admin() {
        return Ok(());
    }
    let patient = state.patients.get_patient(patient_id).await?;
    if actor.role != Role::Patient || patient.user_id != actor.user_id {
        return Err(AppError::Forbidden("Not authorized to modify this patient".to_string()));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn register_patient(
    State(state): State<Arc<PatientCellState>>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<RegisterPatientRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_role(&actor, &[Role::Admin])?;

    let registration = state.patients.register_patient(&actor, request).await?;

    Ok((StatusCode::CREATED, Json(json!(registration))))
}

#[axum::debug_handler]
pub async fn list_patients(
    State(state): State<Arc<PatientCellState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Value>, AppError> {
    require_role(&actor, &[Role::Admin, Role::Doctor])?;

    let patients = state.patients.list_patients().await?;

    Ok(Json(json!({
        "patients": patients,
        "total": patients.len()
    })))
}

#[axum::debug_handler]
pub async fn get_patient(
    State(state): State<Arc<PatientCellState>>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let patient = load_visible(&state, &actor, patient_id).await?;

    Ok(Json(json!(patient)))
}

#[axum::debug_handler]
pub async fn update_medical_profile(
    State(state): State<Arc<PatientCellState>>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<i64>,
    Json(request): Json<UpdateMedicalProfileRequest>,
) -> Result<Json<Value>, AppError> {
    ensure_owner_or_admin(&state, &actor, patient_id).await?;

    let patient = state
        .patients
        .update_medical_profile(&actor, patient_id, request)
        .await?;

    Ok(Json(json!(patient)))
}

#[axum::debug_handler]
pub async fn link_federated_identity(
    State(state): State<Arc<PatientCellState>>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<i64>,
    Json(request): Json<LinkFederatedIdentityRequest>,
) -> Result<Json<Value>, AppError> {
    ensure_owner_or_admin(&state, &actor, patient_id).await?;

    let patient = state
        .patients
        .link_federated_identity(&actor, patient_id, request.uid)
        .await?;

    Ok(Json(json!(patient)))
}
