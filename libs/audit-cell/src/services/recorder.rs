// =====================================================================================
// AUDIT RECORDER - IN-TRANSACTION CHANGE CAPTURE
// =====================================================================================

use std::ops::Deref;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use shared_database::{
    AppointmentChanges, DoctorChanges, EntityStore, NewAppointment, NewAttachment, NewAuditRecord,
    NewDoctor, NewPatient, NewPayment, NewSpecialty, NewUser, PatientChanges, PaymentChanges,
    StoreError, StoreResult, StoreTransaction,
};
use shared_models::clinic::{
    Appointment, Attachment, AuditAction, AuditTable, Doctor, Patient, Payment, Specialty, User,
};

use crate::services::retry::{AuditRetryHandle, AuditRetryWorker};

/// Store transaction that records every write to an audited table.
///
/// Reads go straight through (`Deref`). Writes are only reachable through the
/// methods below, so an audited table cannot be changed without a record.
pub struct AuditedTx<'t> {
    tx: &'t mut dyn StoreTransaction,
    actor_user_id: Option<i64>,
    deferred: Vec<NewAuditRecord>,
}

impl<'t> Deref for AuditedTx<'t> {
    type Target = dyn StoreTransaction + 't;

    fn deref(&self) -> &Self::Target {
        &*self.tx
    }
}

impl<'t> AuditedTx<'t> {
    pub fn new(tx: &'t mut dyn StoreTransaction, actor_user_id: Option<i64>) -> Self {
        Self {
            tx,
            actor_user_id,
            deferred: Vec::new(),
        }
    }

    pub fn actor_user_id(&self) -> Option<i64> {
        self.actor_user_id
    }

    /// Records that could not be written and still need delivery.
    pub fn into_deferred(self) -> Vec<NewAuditRecord> {
        self.deferred
    }

    fn record<T: Serialize>(
        &mut self,
        table: AuditTable,
        action: AuditAction,
        record_id: i64,
        before: Option<&T>,
        after: Option<&T>,
    ) {
        let record = NewAuditRecord {
            table_name: table,
            action,
            record_id,
            before_state: before.map(snapshot),
            after_state: after.map(snapshot),
            actor_user_id: self.actor_user_id,
            occurred_at: Utc::now(),
        };

        match self.tx.append_audit(&record) {
            Ok(written) => {
                debug!(audit_id = written.id, table = %table, record_id, action = %action, "Audit record written");
            }
            Err(e) => {
                warn!(
                    table = %table,
                    record_id,
                    action = %action,
                    error = %e,
                    "Audit write failed, deferring to retry queue"
                );
                self.deferred.push(record);
            }
        }
    }

    // ==================================================================================
    // AUDITED WRITES
    // ==================================================================================

    pub fn insert_user(&mut self, new: &NewUser) -> StoreResult<User> {
        let user = self.tx.insert_user(new)?;
        self.record(AuditTable::Users, AuditAction::Insert, user.id, None, Some(&user));
        Ok(user)
    }

    pub fn insert_specialty(&mut self, new: &NewSpecialty) -> StoreResult<Specialty> {
        let specialty = self.tx.insert_specialty(new)?;
        self.record(AuditTable::Specialties, AuditAction::Insert, specialty.id, None, Some(&specialty));
        Ok(specialty)
    }

    pub fn insert_doctor(&mut self, new: &NewDoctor) -> StoreResult<Doctor> {
        let doctor = self.tx.insert_doctor(new)?;
        self.record(AuditTable::Doctors, AuditAction::Insert, doctor.id, None, Some(&doctor));
        Ok(doctor)
    }

    pub fn update_doctor(&mut self, id: i64, expected_version: i64, changes: &DoctorChanges) -> StoreResult<Doctor> {
        let before = self.tx.find_doctor(id)?;
        let after = self.tx.update_doctor(id, expected_version, changes)?;
        self.record(AuditTable::Doctors, AuditAction::Update, id, before.as_ref(), Some(&after));
        Ok(after)
    }

    pub fn insert_patient(&mut self, new: &NewPatient) -> StoreResult<Patient> {
        let patient = self.tx.insert_patient(new)?;
        self.record(AuditTable::Patients, AuditAction::Insert, patient.id, None, Some(&patient));
        Ok(patient)
    }

    pub fn update_patient(&mut self, id: i64, expected_version: i64, changes: &PatientChanges) -> StoreResult<Patient> {
        let before = self.tx.find_patient(id)?;
        let after = self.tx.update_patient(id, expected_version, changes)?;
        self.record(AuditTable::Patients, AuditAction::Update, id, before.as_ref(), Some(&after));
        Ok(after)
    }

    pub fn insert_appointment(&mut self, new: &NewAppointment) -> StoreResult<Appointment> {
        let appointment = self.tx.insert_appointment(new)?;
        self.record(AuditTable::Appointments, AuditAction::Insert, appointment.id, None, Some(&appointment));
        Ok(appointment)
    }

    pub fn update_appointment(
        &mut self,
        id: i64,
        expected_version: i64,
        changes: &AppointmentChanges,
    ) -> StoreResult<Appointment> {
        let before = self.tx.find_appointment(id)?;
        let after = self.tx.update_appointment(id, expected_version, changes)?;
        self.record(AuditTable::Appointments, AuditAction::Update, id, before.as_ref(), Some(&after));
        Ok(after)
    }

    // ==================================================================================
    // UNAUDITED WRITES
    // ==================================================================================

    pub fn insert_payment(&mut self, new: &NewPayment) -> StoreResult<Payment> {
        self.tx.insert_payment(new)
    }

    pub fn update_payment(&mut self, id: i64, expected_version: i64, changes: &PaymentChanges) -> StoreResult<Payment> {
        self.tx.update_payment(id, expected_version, changes)
    }

    pub fn insert_attachment(&mut self, new: &NewAttachment) -> StoreResult<Attachment> {
        self.tx.insert_attachment(new)
    }

    pub fn delete_attachment(&mut self, id: i64) -> StoreResult<bool> {
        self.tx.delete_attachment(id)
    }
}

fn snapshot<T: Serialize>(entity: &T) -> Value {
    serde_json::to_value(entity).unwrap_or_else(|e| {
        warn!("Failed to serialize audit snapshot: {}", e);
        Value::Null
    })
}

/// Runs business transactions with audit capture and post-commit redelivery.
#[derive(Clone)]
pub struct AuditRecorder<S: EntityStore> {
    store: S,
    retry: AuditRetryHandle,
}

impl<S: EntityStore> AuditRecorder<S> {
    pub fn new(store: S, retry: AuditRetryHandle) -> Self {
        Self { store, retry }
    }

    /// Builds a recorder together with the worker that redelivers failed writes.
    /// The caller spawns the worker.
    pub fn with_retry_worker(store: S, max_attempts: u32, base_delay: Duration) -> (Self, AuditRetryWorker<S>) {
        let (handle, worker) = AuditRetryWorker::new(store.clone(), max_attempts, base_delay);
        (Self::new(store, handle), worker)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_handle(&self) -> &AuditRetryHandle {
        &self.retry
    }

    /// Runs `op` in one write transaction attributed to `actor_user_id`.
    ///
    /// Audit records that failed inside the transaction are queued for
    /// redelivery only once the business writes have committed.
    pub async fn run<T, E, F>(&self, actor_user_id: Option<i64>, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut AuditedTx<'_>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let (value, deferred) = self
            .store
            .transaction(move |tx| -> Result<(T, Vec<NewAuditRecord>), E> {
                let mut audited = AuditedTx::new(tx, actor_user_id);
                let value = op(&mut audited)?;
                Ok((value, audited.into_deferred()))
            })
            .await?;

        for record in deferred {
            self.retry.enqueue(record);
        }

        Ok(value)
    }
}
