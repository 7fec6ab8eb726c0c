//! Entity Store seam.
//!
//! Engines receive an [`EntityStore`] by injection and do all their work
//! through the [`StoreTransaction`] handed to their closure. A closure that
//! returns `Ok` is committed; `Err` rolls everything back.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use shared_models::clinic::{
    Appointment, AppointmentState, Attachment, AuditAction, AuditRecord, AuditTable, BloodType,
    Doctor, EntityState, Patient, Payment, PaymentState, Role, Specialty, User,
};

use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait EntityStore: Clone + Send + Sync + 'static {
    /// Runs `op` inside one write transaction.
    async fn transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static;

    /// Runs `op` against a consistent read snapshot.
    async fn read<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTransaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static;
}

/// Typed, transaction-scoped access to every table.
///
/// Reads take `&self`, writes `&mut self`. Partial updates carry the version
/// the caller read and fail with [`StoreError::StaleVersion`] if another
/// transaction got there first.
pub trait StoreTransaction {
    // users
    fn insert_user(&mut self, new: &NewUser) -> StoreResult<User>;
    fn find_user(&self, id: i64) -> StoreResult<Option<User>>;
    fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    // specialties
    fn insert_specialty(&mut self, new: &NewSpecialty) -> StoreResult<Specialty>;
    fn find_specialty(&self, id: i64) -> StoreResult<Option<Specialty>>;
    fn list_specialties(&self) -> StoreResult<Vec<Specialty>>;

    // doctors
    fn insert_doctor(&mut self, new: &NewDoctor) -> StoreResult<Doctor>;
    fn find_doctor(&self, id: i64) -> StoreResult<Option<Doctor>>;
    fn list_doctors(&self, specialty_id: Option<i64>) -> StoreResult<Vec<Doctor>>;
    fn update_doctor(&mut self, id: i64, expected_version: i64, changes: &DoctorChanges) -> StoreResult<Doctor>;

    // patients
    fn insert_patient(&mut self, new: &NewPatient) -> StoreResult<Patient>;
    fn find_patient(&self, id: i64) -> StoreResult<Option<Patient>>;
    fn list_patients(&self) -> StoreResult<Vec<Patient>>;
    fn update_patient(&mut self, id: i64, expected_version: i64, changes: &PatientChanges) -> StoreResult<Patient>;

    // appointments
    fn insert_appointment(&mut self, new: &NewAppointment) -> StoreResult<Appointment>;
    fn find_appointment(&self, id: i64) -> StoreResult<Option<Appointment>>;
    /// Slot-holding appointment of `doctor_id` at exactly `scheduled_at`, ignoring `exclude_id`.
    fn find_conflicting(
        &self,
        doctor_id: i64,
        scheduled_at: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> StoreResult<Option<Appointment>>;
    /// Earliest pending or confirmed appointment time for a doctor.
    fn earliest_upcoming_slot(&self, doctor_id: i64) -> StoreResult<Option<DateTime<Utc>>>;
    fn list_appointments(&self, filter: &AppointmentFilter) -> StoreResult<Vec<Appointment>>;
    fn update_appointment(
        &mut self,
        id: i64,
        expected_version: i64,
        changes: &AppointmentChanges,
    ) -> StoreResult<Appointment>;

    // payments
    fn insert_payment(&mut self, new: &NewPayment) -> StoreResult<Payment>;
    fn find_payment_by_appointment(&self, appointment_id: i64) -> StoreResult<Option<Payment>>;
    fn update_payment(&mut self, id: i64, expected_version: i64, changes: &PaymentChanges) -> StoreResult<Payment>;

    // attachments
    fn insert_attachment(&mut self, new: &NewAttachment) -> StoreResult<Attachment>;
    fn find_attachment(&self, id: i64) -> StoreResult<Option<Attachment>>;
    fn list_attachments(&self, appointment_id: i64) -> StoreResult<Vec<Attachment>>;
    fn delete_attachment(&mut self, id: i64) -> StoreResult<bool>;

    // audit log (append-only)
    fn append_audit(&mut self, record: &NewAuditRecord) -> StoreResult<AuditRecord>;
    fn fetch_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditRecord>>;
    /// Catalog entries guarding the audit log plus aggregate facts about its rows.
    fn audit_log_health(&self) -> StoreResult<AuditLogHealth>;
}

// ==============================================================================
// INSERT PAYLOADS
// ==============================================================================

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub national_id: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct NewSpecialty {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewDoctor {
    pub user_id: i64,
    pub specialty_id: i64,
    pub license_number: String,
    pub consult_fee: f64,
    pub phone: Option<String>,
    pub availability: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewPatient {
    pub user_id: i64,
    pub phone: Option<String>,
    pub birth_date: NaiveDate,
    pub blood_type: Option<BloodType>,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub medications: Option<String>,
    pub emergency_contact: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub appointment_id: i64,
    pub amount: f64,
    pub method: String,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub appointment_id: i64,
    pub kind: String,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub table_name: AuditTable,
    pub action: AuditAction,
    pub record_id: i64,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub actor_user_id: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

// ==============================================================================
// PARTIAL UPDATES
// ==============================================================================
//
// `None` leaves a column untouched; `Some(None)` writes NULL.

#[derive(Debug, Clone, Default)]
pub struct DoctorChanges {
    pub state: Option<EntityState>,
    pub consult_fee: Option<f64>,
    pub phone: Option<Option<String>>,
    pub availability: Option<Option<Value>>,
    pub next_available_slot: Option<Option<DateTime<Utc>>>,
    pub last_consultation: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct PatientChanges {
    pub phone: Option<Option<String>>,
    pub blood_type: Option<Option<BloodType>>,
    pub allergies: Option<Option<String>>,
    pub chronic_conditions: Option<Option<String>>,
    pub medications: Option<Option<String>>,
    pub emergency_contact: Option<Option<String>>,
    pub federated_uid: Option<Option<String>>,
    pub appointment_count: Option<i64>,
    pub last_consultation: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct AppointmentChanges {
    pub doctor_id: Option<i64>,
    pub state: Option<AppointmentState>,
    pub notes: Option<Option<String>>,
    pub cancelled_at: Option<Option<DateTime<Utc>>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentChanges {
    pub state: Option<PaymentState>,
    pub gateway_reference: Option<Option<String>>,
}

// ==============================================================================
// QUERIES
// ==============================================================================

#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    pub patient_id: Option<i64>,
    pub doctor_id: Option<i64>,
    pub state: Option<AppointmentState>,
    /// Only appointments whose `expires_at` is at or before this instant.
    pub expiring_at_or_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub table: Option<AuditTable>,
    pub record_id: Option<i64>,
    pub actor_user_id: Option<i64>,
    /// Empty means every action.
    pub actions: Vec<AuditAction>,
    /// Inclusive lower bound on `occurred_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub until: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub limit: Option<i64>,
}

impl AuditQuery {
    pub fn for_record(table: AuditTable, record_id: i64) -> Self {
        Self {
            table: Some(table),
            record_id: Some(record_id),
            ..Self::default()
        }
    }
}

/// Raw facts about `audit_log`; judging them is up to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditLogHealth {
    pub table_present: bool,
    pub triggers: Vec<String>,
    pub indexes: Vec<String>,
    /// Stored text, so names outside the known tables and actions still show up.
    pub counts: Vec<AuditCount>,
    pub total: i64,
    pub with_actor: i64,
    /// Snapshots that are not valid JSON.
    pub unparseable_snapshots: i64,
    /// Inserts without an after-snapshot, deletes without a before-snapshot,
    /// updates lacking either.
    pub missing_snapshots: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditCount {
    pub table_name: String,
    pub action: String,
    pub count: i64,
}

/// Shorthand for a missing-row error.
pub fn not_found(entity: &'static str, id: i64) -> StoreError {
    StoreError::NotFound { entity, id }
}
