// libs/doctor-cell/src/models.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use shared_database::{Constraint, StoreError};
use shared_models::clinic::{Doctor, EntityState, User};
use shared_models::error::AppError;

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpecialtyRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDoctorRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub national_id: Option<String>,
    pub specialty_id: i64,
    pub license_number: String,
    pub consult_fee: f64,
    pub phone: Option<String>,
    /// Weekly schedule descriptor, stored as given.
    pub availability: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDoctorStateRequest {
    pub state: EntityState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub availability: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoctorSearchQuery {
    pub specialty_id: Option<i64>,
}

// ==============================================================================
// RESPONSE MODELS
// ==============================================================================

/// The identity and doctor rows created together by registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorRegistration {
    pub user: User,
    pub doctor: Doctor,
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl DoctorError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        DoctorError::NotFound { entity, id }
    }
}

impl From<StoreError> for DoctorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => DoctorError::NotFound { entity, id },
            StoreError::StaleVersion { .. } => DoctorError::ConstraintViolation(err.to_string()),
            StoreError::ConstraintViolation(Constraint::Other(message)) => DoctorError::ConstraintViolation(message),
            StoreError::ConstraintViolation(constraint) => DoctorError::ValidationError(constraint.to_string()),
            StoreError::Transient(message) => DoctorError::TransientStore(message),
            other => DoctorError::Store(other.to_string()),
        }
    }
}

impl From<DoctorError> for AppError {
    fn from(err: DoctorError) -> Self {
        match err {
            DoctorError::NotFound { .. } => AppError::NotFound(err.to_string()),
            DoctorError::ValidationError(message) => AppError::ValidationError(message),
            DoctorError::ConstraintViolation(message) => AppError::conflict("constraint_violation", message),
            DoctorError::TransientStore(message) => AppError::Unavailable(message),
            DoctorError::Store(message) => AppError::Database(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn duplicate_license_is_a_validation_error() {
        let err = DoctorError::from(StoreError::ConstraintViolation(Constraint::LicenseNumber));
        assert!(matches!(err, DoctorError::ValidationError(ref m) if m.contains("license")));

        let app: AppError = err.into();
        assert_eq!(app.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn transient_store_maps_to_unavailable() {
        let app: AppError = DoctorError::from(StoreError::Transient("database is locked".into())).into();
        assert_eq!(app.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
