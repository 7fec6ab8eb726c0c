use std::fmt;

use rusqlite::ErrorCode;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Which schema rule rejected a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Two non-cancelled appointments for the same doctor and instant.
    ActiveSlot,
    LicenseNumber,
    Email,
    SpecialtyName,
    FederatedUid,
    PaymentPerAppointment,
    ForeignKey,
    Other(String),
}

impl Constraint {
    /// Maps a SQLite constraint message to the rule that fired.
    pub fn classify(message: &str) -> Self {
        if message.contains("appointments.doctor_id, appointments.scheduled_at") {
            Constraint::ActiveSlot
        } else if message.contains("doctors.license_number") {
            Constraint::LicenseNumber
        } else if message.contains("users.email") {
            Constraint::Email
        } else if message.contains("specialties.name") {
            Constraint::SpecialtyName
        } else if message.contains("patients.federated_uid") {
            Constraint::FederatedUid
        } else if message.contains("payments.appointment_id") {
            Constraint::PaymentPerAppointment
        } else if message.contains("FOREIGN KEY") {
            Constraint::ForeignKey
        } else {
            Constraint::Other(message.to_string())
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::ActiveSlot => f.write_str("doctor already has an active appointment at that time"),
            Constraint::LicenseNumber => f.write_str("license number already registered"),
            Constraint::Email => f.write_str("email already registered"),
            Constraint::SpecialtyName => f.write_str("specialty name already exists"),
            Constraint::FederatedUid => f.write_str("federated identity already linked to another patient"),
            Constraint::PaymentPerAppointment => f.write_str("appointment already has a payment"),
            Constraint::ForeignKey => f.write_str("referenced record does not exist"),
            Constraint::Other(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{entity} {id} was modified concurrently (expected version {expected})")]
    StaleVersion { entity: &'static str, id: i64, expected: i64 },

    #[error("constraint violated: {0}")]
    ConstraintViolation(Constraint),

    /// Lock wait exceeded or connection trouble. Safe to retry.
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("migration v{version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            match failure.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::OperationInterrupted
                | ErrorCode::CannotOpen => {
                    return StoreError::Transient(err.to_string());
                }
                ErrorCode::ConstraintViolation => {
                    let message = message.as_deref().unwrap_or_default();
                    return StoreError::ConstraintViolation(Constraint::classify(message));
                }
                _ => {}
            }
        }

        match err {
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}
