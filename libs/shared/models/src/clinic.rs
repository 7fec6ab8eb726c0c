//! Typed clinic records. Each struct mirrors one relational table; the store
//! maps rows to these explicitly, column by column.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

// ==============================================================================
// ENUMS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

string_enum!(Role, "role", {
    Patient => "patient",
    Doctor => "doctor",
    Admin => "admin",
});

/// Activation state shared by every entity that can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Active,
    Inactive,
}

string_enum!(EntityState, "state", {
    Active => "active",
    Inactive => "inactive",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BloodType {
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
}

string_enum!(BloodType, "blood type", {
    OPositive => "O+",
    ONegative => "O-",
    APositive => "A+",
    ANegative => "A-",
    BPositive => "B+",
    BNegative => "B-",
    AbPositive => "AB+",
    AbNegative => "AB-",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentState {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

string_enum!(AppointmentState, "appointment state", {
    Pending => "pending",
    Confirmed => "confirmed",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl AppointmentState {
    /// States that hold the (doctor, time) slot.
    pub const SLOT_HOLDING: [AppointmentState; 3] = [
        AppointmentState::Pending,
        AppointmentState::Confirmed,
        AppointmentState::Completed,
    ];

    /// Still upcoming: counts towards a doctor's next available slot.
    pub fn is_upcoming(&self) -> bool {
        matches!(self, AppointmentState::Pending | AppointmentState::Confirmed)
    }

    pub fn holds_slot(&self) -> bool {
        *self != AppointmentState::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentState::Completed | AppointmentState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Completed,
    Cancelled,
}

string_enum!(PaymentState, "payment state", {
    Pending => "pending",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

string_enum!(AuditAction, "audit action", {
    Insert => "insert",
    Update => "update",
    Delete => "delete",
});

/// Tables whose mutations are recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTable {
    Appointments,
    Doctors,
    Patients,
    Users,
    Specialties,
}

string_enum!(AuditTable, "audited table", {
    Appointments => "appointments",
    Doctors => "doctors",
    Patients => "patients",
    Users => "users",
    Specialties => "specialties",
});

impl AuditTable {
    pub const ALL: [AuditTable; 5] = [
        AuditTable::Appointments,
        AuditTable::Doctors,
        AuditTable::Patients,
        AuditTable::Users,
        AuditTable::Specialties,
    ];
}

// ==============================================================================
// ENTITIES
// ==============================================================================

/// Base identity referenced by doctors and patients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub national_id: Option<String>,
    pub role: Role,
    pub state: EntityState,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specialty {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: i64,
    pub user_id: i64,
    pub specialty_id: i64,
    pub license_number: String,
    pub consult_fee: f64,
    pub phone: Option<String>,
    pub state: EntityState,
    /// Opaque weekly schedule descriptor.
    pub availability: Option<Value>,
    pub next_available_slot: Option<DateTime<Utc>>,
    pub last_consultation: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Doctor {
    pub fn is_active(&self) -> bool {
        self.state == EntityState::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub user_id: i64,
    pub phone: Option<String>,
    pub birth_date: NaiveDate,
    pub blood_type: Option<BloodType>,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub medications: Option<String>,
    pub emergency_contact: Option<String>,
    pub federated_uid: Option<String>,
    pub appointment_count: i64,
    pub last_consultation: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub state: AppointmentState,
    pub notes: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Pending bookings lapse at this instant unless confirmed.
    pub expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub appointment_id: i64,
    pub amount: f64,
    pub method: String,
    pub state: PaymentState,
    pub gateway_reference: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub appointment_id: i64,
    pub kind: String,
    pub url: String,
    pub name: String,
    pub uploaded_at: DateTime<Utc>,
}

/// One immutable entry of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub table_name: AuditTable,
    pub action: AuditAction,
    pub record_id: i64,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub actor_user_id: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_text() {
        assert_eq!("cancelled".parse::<AppointmentState>(), Ok(AppointmentState::Cancelled));
        assert_eq!("AB-".parse::<BloodType>(), Ok(BloodType::AbNegative));
        assert_eq!(AuditTable::Specialties.to_string(), "specialties");
    }

    #[test]
    fn unknown_values_are_rejected() {
        let err = "payments".parse::<AuditTable>().unwrap_err();
        assert_eq!(err.kind, "audited table");
        assert!("archived".parse::<AppointmentState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(AppointmentState::Completed.is_terminal());
        assert!(AppointmentState::Cancelled.is_terminal());
        assert!(!AppointmentState::Confirmed.is_terminal());
        assert!(AppointmentState::Completed.holds_slot());
        assert!(!AppointmentState::Completed.is_upcoming());
    }

    #[test]
    fn blood_type_serializes_with_sign() {
        let json = serde_json::to_string(&BloodType::OPositive).unwrap();
        assert_eq!(json, "\"O+\"");
    }
}
