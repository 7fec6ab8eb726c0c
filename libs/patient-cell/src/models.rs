// libs/patient-cell/src/models.rs
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use shared_database::{Constraint, StoreError};
use shared_models::clinic::{BloodType, Patient, User};
use shared_models::error::AppError;

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPatientRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub national_id: Option<String>,
    pub phone: Option<String>,
    pub birth_date: NaiveDate,
    pub blood_type: Option<BloodType>,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub medications: Option<String>,
    pub emergency_contact: Option<String>,
}

/// Partial medical profile update.
///
/// An absent field is left alone, an explicit `null` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateMedicalProfileRequest {
    #[serde(default, deserialize_with = "present")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub blood_type: Option<Option<BloodType>>,
    #[serde(default, deserialize_with = "present")]
    pub allergies: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub chronic_conditions: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub medications: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub emergency_contact: Option<Option<String>>,
}

impl UpdateMedicalProfileRequest {
    pub fn is_empty(&self) -> bool {
        self.phone.is_none()
            && self.blood_type.is_none()
            && self.allergies.is_none()
            && self.chronic_conditions.is_none()
            && self.medications.is_none()
            && self.emergency_contact.is_none()
    }
}

fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkFederatedIdentityRequest {
    pub uid: String,
}

// ==============================================================================
// RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRegistration {
    pub user: User,
    pub patient: Patient,
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, Error)]
pub enum PatientError {
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

impl PatientError {
    pub fn not_found(id: i64) -> Self {
        PatientError::NotFound { entity: "patient", id }
    }
}

impl From<StoreError> for PatientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => PatientError::NotFound { entity, id },
            StoreError::StaleVersion { .. } => PatientError::ConstraintViolation(err.to_string()),
            StoreError::ConstraintViolation(Constraint::Other(message)) => PatientError::ConstraintViolation(message),
            StoreError::ConstraintViolation(constraint) => PatientError::ValidationError(constraint.to_string()),
            StoreError::Transient(message) => PatientError::TransientStore(message),
            other => PatientError::Store(other.to_string()),
        }
    }
}

impl From<PatientError> for AppError {
    fn from(err: PatientError) -> Self {
        match err {
            PatientError::NotFound { .. } => AppError::NotFound(err.to_string()),
            PatientError::ValidationError(message) => AppError::ValidationError(message),
            PatientError::ConstraintViolation(message) => AppError::conflict("constraint_violation", message),
            PatientError::TransientStore(message) => AppError::Unavailable(message),
            PatientError::Store(message) => AppError::Database(message),
        }
    }
}
