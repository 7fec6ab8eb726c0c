// libs/appointment-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared_database::{Constraint, StoreError};
use shared_models::clinic::{AppointmentState, PaymentState};
use shared_models::error::AppError;

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub patient_id: i64,
    pub doctor_id: i64,
    /// Stored with microsecond precision; finer values are rejected.
    pub scheduled_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignDoctorRequest {
    pub new_doctor_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNotesRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount: f64,
    pub method: String,
}

/// Status reported by the payment gateway for one appointment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatusReport {
    pub state: PaymentState,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachFileRequest {
    pub kind: String,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentSearchQuery {
    pub patient_id: Option<i64>,
    pub doctor_id: Option<i64>,
    pub state: Option<AppointmentState>,
}

// ==============================================================================
// CONSISTENCY MODELS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleBooking {
    pub doctor_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub appointment_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMismatch {
    pub patient_id: i64,
    pub recorded: i64,
    pub actual: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMismatch {
    pub doctor_id: i64,
    pub recorded: Option<DateTime<Utc>>,
    pub expected: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub is_consistent: bool,
    pub double_bookings: Vec<DoubleBooking>,
    pub count_mismatches: Vec<CountMismatch>,
    pub slot_mismatches: Vec<SlotMismatch>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Slot unavailable: {0}")]
    SlotUnavailable(String),

    #[error("Appointment {0} is already cancelled")]
    AlreadyCancelled(i64),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Doctor {0} is inactive")]
    DoctorInactive(i64),

    #[error("Store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl SchedulingError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        SchedulingError::NotFound { entity, id }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::NotFound { .. } => "not_found",
            SchedulingError::SlotUnavailable(_) => "slot_unavailable",
            SchedulingError::AlreadyCancelled(_) => "already_cancelled",
            SchedulingError::InvalidTransition(_) => "invalid_transition",
            SchedulingError::ValidationError(_) => "validation_error",
            SchedulingError::ConstraintViolation(_) => "constraint_violation",
            SchedulingError::DoctorInactive(_) => "doctor_inactive",
            SchedulingError::TransientStore(_) => "transient_store_error",
            SchedulingError::Store(_) => "store_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulingError::TransientStore(_))
    }
}

impl From<StoreError> for SchedulingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => SchedulingError::NotFound { entity, id },
            StoreError::StaleVersion { .. } => SchedulingError::ConstraintViolation(err.to_string()),
            StoreError::ConstraintViolation(constraint) => match constraint {
                // Lost the race against a concurrent booking of the same slot
                Constraint::ActiveSlot => SchedulingError::SlotUnavailable(constraint.to_string()),
                Constraint::Other(message) => SchedulingError::ConstraintViolation(message),
                other => SchedulingError::ValidationError(other.to_string()),
            },
            StoreError::Transient(message) => SchedulingError::TransientStore(message),
            other => SchedulingError::Store(other.to_string()),
        }
    }
}

impl From<SchedulingError> for AppError {
    fn from(err: SchedulingError) -> Self {
        match err {
            SchedulingError::NotFound { .. } => AppError::NotFound(err.to_string()),
            SchedulingError::ValidationError(message) => AppError::ValidationError(message),
            SchedulingError::TransientStore(message) => AppError::Unavailable(message),
            SchedulingError::Store(message) => AppError::Database(message),
            other => AppError::conflict(other.kind(), other.to_string()),
        }
    }
}
