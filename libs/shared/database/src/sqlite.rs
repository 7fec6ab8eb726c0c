use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use shared_config::AppConfig;
use shared_models::clinic::{
    Appointment, Attachment, AuditRecord, Doctor, Patient, Payment, Specialty, User,
};

use crate::error::{StoreError, StoreResult};
use crate::store::*;

const USER_COLUMNS: &str =
    "id, email, first_name, last_name, national_id, role, state, version, created_at, updated_at";
const SPECIALTY_COLUMNS: &str = "id, name, description, version, created_at, updated_at";
const DOCTOR_COLUMNS: &str = "id, user_id, specialty_id, license_number, consult_fee, phone, state, \
     availability, next_available_slot, last_consultation, version, created_at, updated_at";
const PATIENT_COLUMNS: &str = "id, user_id, phone, birth_date, blood_type, allergies, chronic_conditions, \
     medications, emergency_contact, federated_uid, appointment_count, last_consultation, version, \
     created_at, updated_at";
const APPOINTMENT_COLUMNS: &str = "id, patient_id, doctor_id, scheduled_at, reason, state, notes, \
     cancelled_at, expires_at, version, created_at, updated_at";
const PAYMENT_COLUMNS: &str =
    "id, appointment_id, amount, method, state, gateway_reference, version, created_at, updated_at";
const ATTACHMENT_COLUMNS: &str = "id, appointment_id, kind, url, name, uploaded_at";
const AUDIT_COLUMNS: &str =
    "id, table_name, action, record_id, before_state, after_state, actor_user_id, occurred_at";

/// SQLite-backed [`EntityStore`].
///
/// Every transaction opens its own connection, so concurrent callers never
/// share connection state. Writers take the database write lock up front
/// (`BEGIN IMMEDIATE`) and wait at most `busy_timeout` for it.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and applies pending migrations.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let store = Self {
            inner: Arc::new(StoreInner {
                path: path.as_ref().to_path_buf(),
                busy_timeout,
            }),
        };

        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        run_migrations(&conn)?;

        info!("Entity store ready at {}", store.inner.path.display());
        Ok(store)
    }

    pub fn from_config(config: &AppConfig) -> StoreResult<Self> {
        Self::open(&config.database_path, config.statement_timeout())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.inner.path)?;
        conn.busy_timeout(self.inner.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;
             PRAGMA synchronous=NORMAL;",
        )?;
        Ok(conn)
    }

    fn run_write<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let outcome = {
            let mut handle = SqliteTransaction { conn: &*tx };
            op(&mut handle)
        };

        match outcome {
            Ok(value) => {
                tx.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back
                debug!("Rolling back store transaction");
                drop(tx);
                Err(err)
            }
        }
    }

    fn run_read<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTransaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)?;

        let outcome = {
            let handle = SqliteTransaction { conn: &*tx };
            op(&handle)
        };

        tx.commit().map_err(StoreError::from)?;
        outcome
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.run_write(op))
            .await
            .map_err(|e| E::from(StoreError::Database(format!("store task failed: {}", e))))?
    }

    async fn read<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTransaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.run_read(op))
            .await
            .map_err(|e| E::from(StoreError::Database(format!("store task failed: {}", e))))?
    }
}

// ==============================================================================
// MIGRATIONS
// ==============================================================================

fn run_migrations(conn: &Connection) -> StoreResult<()> {
    let current_version = current_schema_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(1, include_str!("../migrations/001_initial.sql"))];

    for (version, sql) in migrations {
        if version > current_version {
            info!("Running migration v{}", version);
            conn.execute_batch(sql).map_err(|e| StoreError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// 0 when the schema has never been created.
fn current_schema_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .ok()
    .flatten()
    .unwrap_or(0)
}

// ==============================================================================
// TRANSACTION HANDLE
// ==============================================================================

struct SqliteTransaction<'c> {
    conn: &'c Connection,
}

impl SqliteTransaction<'_> {
    fn find_one<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Option<T>> {
        Ok(self.conn.query_row(sql, params, map).optional()?)
    }

    fn find_many<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Applies `sets` to one row if its version still matches, bumping the version.
    fn apply_update(
        &self,
        table: &str,
        entity: &'static str,
        id: i64,
        expected_version: i64,
        sets: Vec<(&'static str, Value)>,
    ) -> StoreResult<()> {
        let mut assignments: Vec<String> = sets.iter().map(|(column, _)| format!("{} = ?", column)).collect();
        assignments.push("version = version + 1".to_string());
        assignments.push("updated_at = ?".to_string());

        let mut values: Vec<Value> = sets.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Text(ts(&Utc::now())));
        values.push(Value::Integer(id));
        values.push(Value::Integer(expected_version));

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ? AND version = ?",
            table,
            assignments.join(", ")
        );
        let changed = self.conn.execute(&sql, params_from_iter(values))?;

        if changed == 0 {
            let exists: bool = self.conn.query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table),
                [id],
                |row| row.get(0),
            )?;
            return Err(if exists {
                StoreError::StaleVersion { entity, id, expected: expected_version }
            } else {
                not_found(entity, id)
            });
        }

        Ok(())
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn insert_user(&mut self, new: &NewUser) -> StoreResult<User> {
        let now = ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO users (email, first_name, last_name, national_id, role, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)",
            params![new.email, new.first_name, new.last_name, new.national_id, new.role.as_str(), now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_user(id)?.ok_or_else(|| not_found("user", id))
    }

    fn find_user(&self, id: i64) -> StoreResult<Option<User>> {
        self.find_one(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            [id],
            user_from_row,
        )
    }

    fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.find_one(
            &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
            [email],
            user_from_row,
        )
    }

    fn insert_specialty(&mut self, new: &NewSpecialty) -> StoreResult<Specialty> {
        let now = ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO specialties (name, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![new.name, new.description, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_specialty(id)?.ok_or_else(|| not_found("specialty", id))
    }

    fn find_specialty(&self, id: i64) -> StoreResult<Option<Specialty>> {
        self.find_one(
            &format!("SELECT {} FROM specialties WHERE id = ?1", SPECIALTY_COLUMNS),
            [id],
            specialty_from_row,
        )
    }

    fn list_specialties(&self) -> StoreResult<Vec<Specialty>> {
        self.find_many(
            &format!("SELECT {} FROM specialties ORDER BY name", SPECIALTY_COLUMNS),
            [],
            specialty_from_row,
        )
    }

    fn insert_doctor(&mut self, new: &NewDoctor) -> StoreResult<Doctor> {
        let now = ts(&Utc::now());
        let availability = new.availability.as_ref().map(|value| value.to_string());
        self.conn.execute(
            "INSERT INTO doctors (user_id, specialty_id, license_number, consult_fee, phone, state, availability, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?7)",
            params![
                new.user_id,
                new.specialty_id,
                new.license_number,
                new.consult_fee,
                new.phone,
                availability,
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_doctor(id)?.ok_or_else(|| not_found("doctor", id))
    }

    fn find_doctor(&self, id: i64) -> StoreResult<Option<Doctor>> {
        self.find_one(
            &format!("SELECT {} FROM doctors WHERE id = ?1", DOCTOR_COLUMNS),
            [id],
            doctor_from_row,
        )
    }

    fn list_doctors(&self, specialty_id: Option<i64>) -> StoreResult<Vec<Doctor>> {
        self.find_many(
            &format!(
                "SELECT {} FROM doctors WHERE (?1 IS NULL OR specialty_id = ?1) ORDER BY id",
                DOCTOR_COLUMNS
            ),
            [specialty_id],
            doctor_from_row,
        )
    }

    fn update_doctor(&mut self, id: i64, expected_version: i64, changes: &DoctorChanges) -> StoreResult<Doctor> {
        let mut sets = Vec::new();
        if let Some(state) = changes.state {
            sets.push(("state", Value::Text(state.as_str().to_string())));
        }
        if let Some(fee) = changes.consult_fee {
            sets.push(("consult_fee", Value::Real(fee)));
        }
        if let Some(phone) = &changes.phone {
            sets.push(("phone", opt_text(phone.clone())));
        }
        if let Some(availability) = &changes.availability {
            sets.push(("availability", opt_text(availability.as_ref().map(|v| v.to_string()))));
        }
        if let Some(slot) = changes.next_available_slot {
            sets.push(("next_available_slot", opt_time(slot)));
        }
        if let Some(last) = changes.last_consultation {
            sets.push(("last_consultation", opt_time(last)));
        }

        self.apply_update("doctors", "doctor", id, expected_version, sets)?;
        self.find_doctor(id)?.ok_or_else(|| not_found("doctor", id))
    }

    fn insert_patient(&mut self, new: &NewPatient) -> StoreResult<Patient> {
        let now = ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO patients (user_id, phone, birth_date, blood_type, allergies, chronic_conditions,
                                   medications, emergency_contact, appointment_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
            params![
                new.user_id,
                new.phone,
                new.birth_date.format("%Y-%m-%d").to_string(),
                new.blood_type.map(|b| b.as_str()),
                new.allergies,
                new.chronic_conditions,
                new.medications,
                new.emergency_contact,
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_patient(id)?.ok_or_else(|| not_found("patient", id))
    }

    fn find_patient(&self, id: i64) -> StoreResult<Option<Patient>> {
        self.find_one(
            &format!("SELECT {} FROM patients WHERE id = ?1", PATIENT_COLUMNS),
            [id],
            patient_from_row,
        )
    }

    fn list_patients(&self) -> StoreResult<Vec<Patient>> {
        self.find_many(
            &format!("SELECT {} FROM patients ORDER BY id", PATIENT_COLUMNS),
            [],
            patient_from_row,
        )
    }

    fn update_patient(&mut self, id: i64, expected_version: i64, changes: &PatientChanges) -> StoreResult<Patient> {
        let mut sets = Vec::new();
        if let Some(phone) = &changes.phone {
            sets.push(("phone", opt_text(phone.clone())));
        }
        if let Some(blood_type) = changes.blood_type {
            sets.push(("blood_type", opt_text(blood_type.map(|b| b.as_str().to_string()))));
        }
        if let Some(allergies) = &changes.allergies {
            sets.push(("allergies", opt_text(allergies.clone())));
        }
        if let Some(conditions) = &changes.chronic_conditions {
            sets.push(("chronic_conditions", opt_text(conditions.clone())));
        }
        if let Some(medications) = &changes.medications {
            sets.push(("medications", opt_text(medications.clone())));
        }
        if let Some(contact) = &changes.emergency_contact {
            sets.push(("emergency_contact", opt_text(contact.clone())));
        }
        if let Some(uid) = &changes.federated_uid {
            sets.push(("federated_uid", opt_text(uid.clone())));
        }
        if let Some(count) = changes.appointment_count {
            sets.push(("appointment_count", Value::Integer(count)));
        }
        if let Some(last) = changes.last_consultation {
            sets.push(("last_consultation", opt_time(last)));
        }

        self.apply_update("patients", "patient", id, expected_version, sets)?;
        self.find_patient(id)?.ok_or_else(|| not_found("patient", id))
    }

    fn insert_appointment(&mut self, new: &NewAppointment) -> StoreResult<Appointment> {
        let now = ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO appointments (patient_id, doctor_id, scheduled_at, reason, state, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
            params![
                new.patient_id,
                new.doctor_id,
                ts(&new.scheduled_at),
                new.reason,
                new.expires_at.as_ref().map(ts),
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_appointment(id)?.ok_or_else(|| not_found("appointment", id))
    }

    fn find_appointment(&self, id: i64) -> StoreResult<Option<Appointment>> {
        self.find_one(
            &format!("SELECT {} FROM appointments WHERE id = ?1", APPOINTMENT_COLUMNS),
            [id],
            appointment_from_row,
        )
    }

    fn find_conflicting(
        &self,
        doctor_id: i64,
        scheduled_at: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> StoreResult<Option<Appointment>> {
        self.find_one(
            &format!(
                "SELECT {} FROM appointments
                 WHERE doctor_id = ?1 AND scheduled_at = ?2
                   AND state IN ('pending', 'confirmed', 'completed')
                   AND (?3 IS NULL OR id <> ?3)
                 LIMIT 1",
                APPOINTMENT_COLUMNS
            ),
            params![doctor_id, ts(&scheduled_at), exclude_id],
            appointment_from_row,
        )
    }

    fn earliest_upcoming_slot(&self, doctor_id: i64) -> StoreResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.conn.query_row(
            "SELECT MIN(scheduled_at) FROM appointments
             WHERE doctor_id = ?1 AND state IN ('pending', 'confirmed')",
            [doctor_id],
            |row| row.get(0),
        )?;
        raw.map(|value| parse_time(&value).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    }

    fn list_appointments(&self, filter: &AppointmentFilter) -> StoreResult<Vec<Appointment>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(patient_id) = filter.patient_id {
            clauses.push("patient_id = ?");
            values.push(Value::Integer(patient_id));
        }
        if let Some(doctor_id) = filter.doctor_id {
            clauses.push("doctor_id = ?");
            values.push(Value::Integer(doctor_id));
        }
        if let Some(state) = filter.state {
            clauses.push("state = ?");
            values.push(Value::Text(state.as_str().to_string()));
        }
        if let Some(cutoff) = filter.expiring_at_or_before {
            clauses.push("expires_at IS NOT NULL AND expires_at <= ?");
            values.push(Value::Text(ts(&cutoff)));
        }

        let sql = format!(
            "SELECT {} FROM appointments{} ORDER BY scheduled_at, id",
            APPOINTMENT_COLUMNS,
            where_clause(&clauses)
        );
        self.find_many(&sql, params_from_iter(values), appointment_from_row)
    }

    fn update_appointment(
        &mut self,
        id: i64,
        expected_version: i64,
        changes: &AppointmentChanges,
    ) -> StoreResult<Appointment> {
        let mut sets = Vec::new();
        if let Some(doctor_id) = changes.doctor_id {
            sets.push(("doctor_id", Value::Integer(doctor_id)));
        }
        if let Some(state) = changes.state {
            sets.push(("state", Value::Text(state.as_str().to_string())));
        }
        if let Some(notes) = &changes.notes {
            sets.push(("notes", opt_text(notes.clone())));
        }
        if let Some(cancelled_at) = changes.cancelled_at {
            sets.push(("cancelled_at", opt_time(cancelled_at)));
        }
        if let Some(expires_at) = changes.expires_at {
            sets.push(("expires_at", opt_time(expires_at)));
        }

        self.apply_update("appointments", "appointment", id, expected_version, sets)?;
        self.find_appointment(id)?.ok_or_else(|| not_found("appointment", id))
    }

    fn insert_payment(&mut self, new: &NewPayment) -> StoreResult<Payment> {
        let now = ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO payments (appointment_id, amount, method, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![new.appointment_id, new.amount, new.method, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_one(
            &format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLUMNS),
            [id],
            payment_from_row,
        )?
        .ok_or_else(|| not_found("payment", id))
    }

    fn find_payment_by_appointment(&self, appointment_id: i64) -> StoreResult<Option<Payment>> {
        self.find_one(
            &format!("SELECT {} FROM payments WHERE appointment_id = ?1", PAYMENT_COLUMNS),
            [appointment_id],
            payment_from_row,
        )
    }

    fn update_payment(&mut self, id: i64, expected_version: i64, changes: &PaymentChanges) -> StoreResult<Payment> {
        let mut sets = Vec::new();
        if let Some(state) = changes.state {
            sets.push(("state", Value::Text(state.as_str().to_string())));
        }
        if let Some(reference) = &changes.gateway_reference {
            sets.push(("gateway_reference", opt_text(reference.clone())));
        }

        self.apply_update("payments", "payment", id, expected_version, sets)?;
        self.find_one(
            &format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLUMNS),
            [id],
            payment_from_row,
        )?
        .ok_or_else(|| not_found("payment", id))
    }

    fn insert_attachment(&mut self, new: &NewAttachment) -> StoreResult<Attachment> {
        self.conn.execute(
            "INSERT INTO attachments (appointment_id, kind, url, name, uploaded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new.appointment_id, new.kind, new.url, new.name, ts(&Utc::now())],
        )?;
        let id = self.conn.last_insert_rowid();
        self.find_attachment(id)?.ok_or_else(|| not_found("attachment", id))
    }

    fn find_attachment(&self, id: i64) -> StoreResult<Option<Attachment>> {
        self.find_one(
            &format!("SELECT {} FROM attachments WHERE id = ?1", ATTACHMENT_COLUMNS),
            [id],
            attachment_from_row,
        )
    }

    fn list_attachments(&self, appointment_id: i64) -> StoreResult<Vec<Attachment>> {
        self.find_many(
            &format!(
                "SELECT {} FROM attachments WHERE appointment_id = ?1 ORDER BY uploaded_at, id",
                ATTACHMENT_COLUMNS
            ),
            [appointment_id],
            attachment_from_row,
        )
    }

    fn delete_attachment(&mut self, id: i64) -> StoreResult<bool> {
        let removed = self.conn.execute("DELETE FROM attachments WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    fn append_audit(&mut self, record: &NewAuditRecord) -> StoreResult<AuditRecord> {
        // A failed audit insert must not poison the surrounding business transaction
        self.conn.execute_batch("SAVEPOINT audit_write")?;

        let inserted = self.conn.execute(
            "INSERT INTO audit_log (table_name, action, record_id, before_state, after_state, actor_user_id, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.table_name.as_str(),
                record.action.as_str(),
                record.record_id,
                record.before_state.as_ref().map(|v| v.to_string()),
                record.after_state.as_ref().map(|v| v.to_string()),
                record.actor_user_id,
                ts(&record.occurred_at)
            ],
        );

        match inserted {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                self.conn.execute_batch("RELEASE audit_write")?;
                self.find_one(
                    &format!("SELECT {} FROM audit_log WHERE id = ?1", AUDIT_COLUMNS),
                    [id],
                    audit_from_row,
                )?
                .ok_or_else(|| not_found("audit record", id))
            }
            Err(err) => {
                self.conn.execute_batch("ROLLBACK TO audit_write; RELEASE audit_write")?;
                Err(err.into())
            }
        }
    }

    fn fetch_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(table) = query.table {
            clauses.push("table_name = ?".to_string());
            values.push(Value::Text(table.as_str().to_string()));
        }
        if let Some(record_id) = query.record_id {
            clauses.push("record_id = ?".to_string());
            values.push(Value::Integer(record_id));
        }
        if let Some(actor) = query.actor_user_id {
            clauses.push("actor_user_id = ?".to_string());
            values.push(Value::Integer(actor));
        }
        if !query.actions.is_empty() {
            let placeholders = vec!["?"; query.actions.len()].join(", ");
            clauses.push(format!("action IN ({})", placeholders));
            values.extend(query.actions.iter().map(|a| Value::Text(a.as_str().to_string())));
        }
        if let Some(since) = query.since {
            clauses.push("occurred_at >= ?".to_string());
            values.push(Value::Text(ts(&since)));
        }
        if let Some(until) = query.until {
            clauses.push("occurred_at < ?".to_string());
            values.push(Value::Text(ts(&until)));
        }

        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let clause_refs: Vec<&str> = clauses.iter().map(String::as_str).collect();
        let mut sql = format!(
            "SELECT {} FROM audit_log{} ORDER BY occurred_at {dir}, id {dir}",
            AUDIT_COLUMNS,
            where_clause(&clause_refs),
            dir = direction
        );
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit));
        }

        self.find_many(&sql, params_from_iter(values), audit_from_row)
    }

    fn audit_log_health(&self) -> StoreResult<AuditLogHealth> {
        let mut health = AuditLogHealth::default();

        let mut stmt = self.conn.prepare(
            "SELECT type, name FROM sqlite_master
             WHERE tbl_name = 'audit_log' AND type IN ('table', 'trigger', 'index')
             ORDER BY name",
        )?;
        let objects = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (kind, name) in objects {
            match kind.as_str() {
                "table" => health.table_present = true,
                "trigger" => health.triggers.push(name),
                _ => health.indexes.push(name),
            }
        }
        if !health.table_present {
            return Ok(health);
        }

        health.counts = self.find_many(
            "SELECT table_name, action, COUNT(*) AS count FROM audit_log
             GROUP BY table_name, action ORDER BY table_name, action",
            [],
            audit_count_from_row,
        )?;

        let (total, with_actor, unparseable, missing) = self.conn.query_row(
            "SELECT COUNT(*),
                    COUNT(actor_user_id),
                    COALESCE(SUM(CASE WHEN (before_state IS NOT NULL AND json_valid(before_state) = 0)
                                        OR (after_state IS NOT NULL AND json_valid(after_state) = 0)
                                      THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN (action = 'insert' AND after_state IS NULL)
                                        OR (action = 'delete' AND before_state IS NULL)
                                        OR (action = 'update' AND (before_state IS NULL OR after_state IS NULL))
                                      THEN 1 ELSE 0 END), 0)
             FROM audit_log",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        health.total = total;
        health.with_actor = with_actor;
        health.unparseable_snapshots = unparseable;
        health.missing_snapshots = missing;

        Ok(health)
    }
}

// ==============================================================================
// ROW MAPPING
// ==============================================================================

/// Fixed-width UTC text: equal instants give equal strings and ordering is preserved.
pub fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

fn where_clause(clauses: &[&str]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn opt_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

fn opt_time(value: Option<DateTime<Utc>>) -> Value {
    value.map(|t| Value::Text(ts(&t))).unwrap_or(Value::Null)
}

fn conversion_error(
    row: &Row<'_>,
    column: &str,
    err: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into())
}

fn get_time(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_time(&raw).map_err(|e| conversion_error(row, column, e))
}

fn get_opt_time(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|value| parse_time(&value).map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

fn get_enum<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e| conversion_error(row, column, e))
}

fn get_opt_enum<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(column)?;
    raw.map(|value| value.parse().map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

fn get_json(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|value| serde_json::from_str(&value).map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        first_name: row.get("first_name")?,
        last_name: row.get("last_name")?,
        national_id: row.get("national_id")?,
        role: get_enum(row, "role")?,
        state: get_enum(row, "state")?,
        version: row.get("version")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn specialty_from_row(row: &Row<'_>) -> rusqlite::Result<Specialty> {
    Ok(Specialty {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        version: row.get("version")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn doctor_from_row(row: &Row<'_>) -> rusqlite::Result<Doctor> {
    Ok(Doctor {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        specialty_id: row.get("specialty_id")?,
        license_number: row.get("license_number")?,
        consult_fee: row.get("consult_fee")?,
        phone: row.get("phone")?,
        state: get_enum(row, "state")?,
        availability: get_json(row, "availability")?,
        next_available_slot: get_opt_time(row, "next_available_slot")?,
        last_consultation: get_opt_time(row, "last_consultation")?,
        version: row.get("version")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    let birth_raw: String = row.get("birth_date")?;
    let birth_date = NaiveDate::parse_from_str(&birth_raw, "%Y-%m-%d")
        .map_err(|e| conversion_error(row, "birth_date", e))?;

    Ok(Patient {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        phone: row.get("phone")?,
        birth_date,
        blood_type: get_opt_enum(row, "blood_type")?,
        allergies: row.get("allergies")?,
        chronic_conditions: row.get("chronic_conditions")?,
        medications: row.get("medications")?,
        emergency_contact: row.get("emergency_contact")?,
        federated_uid: row.get("federated_uid")?,
        appointment_count: row.get("appointment_count")?,
        last_consultation: get_opt_time(row, "last_consultation")?,
        version: row.get("version")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn appointment_from_row(row: &Row<'_>) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: row.get("id")?,
        patient_id: row.get("patient_id")?,
        doctor_id: row.get("doctor_id")?,
        scheduled_at: get_time(row, "scheduled_at")?,
        reason: row.get("reason")?,
        state: get_enum(row, "state")?,
        notes: row.get("notes")?,
        cancelled_at: get_opt_time(row, "cancelled_at")?,
        expires_at: get_opt_time(row, "expires_at")?,
        version: row.get("version")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get("id")?,
        appointment_id: row.get("appointment_id")?,
        amount: row.get("amount")?,
        method: row.get("method")?,
        state: get_enum(row, "state")?,
        gateway_reference: row.get("gateway_reference")?,
        version: row.get("version")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get("id")?,
        appointment_id: row.get("appointment_id")?,
        kind: row.get("kind")?,
        url: row.get("url")?,
        name: row.get("name")?,
        uploaded_at: get_time(row, "uploaded_at")?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.get("id")?,
        table_name: get_enum(row, "table_name")?,
        action: get_enum(row, "action")?,
        record_id: row.get("record_id")?,
        before_state: get_json(row, "before_state")?,
        after_state: get_json(row, "after_state")?,
        actor_user_id: row.get("actor_user_id")?,
        occurred_at: get_time(row, "occurred_at")?,
    })
}

fn audit_count_from_row(row: &Row<'_>) -> rusqlite::Result<AuditCount> {
    Ok(AuditCount {
        table_name: row.get("table_name")?,
        action: row.get("action")?,
        count: row.get("count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use shared_models::clinic::{AppointmentState, AuditAction, AuditTable, Role};
    use tempfile::TempDir;

    use crate::error::Constraint;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("clinic.db"), Duration::from_secs(5)).unwrap();
        (dir, store)
    }

    fn slot() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2031, 3, 14, 9, 30, 0).unwrap()
    }

    /// Seeds one specialty, one doctor and one patient; returns (doctor_id, patient_id).
    fn seed(tx: &mut dyn StoreTransaction) -> StoreResult<(i64, i64)> {
        let specialty = tx.insert_specialty(&NewSpecialty {
            name: "Cardiology".into(),
            description: None,
        })?;
        let doctor_user = tx.insert_user(&NewUser {
            email: "house@clinic.test".into(),
            first_name: "Greg".into(),
            last_name: "House".into(),
            national_id: None,
            role: Role::Doctor,
        })?;
        let doctor = tx.insert_doctor(&NewDoctor {
            user_id: doctor_user.id,
            specialty_id: specialty.id,
            license_number: "LIC-1".into(),
            consult_fee: 100.0,
            phone: None,
            availability: Some(json!({"mon": ["09:00-12:00"]})),
        })?;
        let patient_user = tx.insert_user(&NewUser {
            email: "ana@clinic.test".into(),
            first_name: "Ana".into(),
            last_name: "Diaz".into(),
            national_id: Some("30111222".into()),
            role: Role::Patient,
        })?;
        let patient = tx.insert_patient(&NewPatient {
            user_id: patient_user.id,
            phone: None,
            birth_date: NaiveDate::from_ymd_opt(1990, 5, 1).unwrap(),
            blood_type: None,
            allergies: None,
            chronic_conditions: None,
            medications: None,
            emergency_contact: None,
        })?;
        Ok((doctor.id, patient.id))
    }

    fn booking(doctor_id: i64, patient_id: i64) -> NewAppointment {
        NewAppointment {
            patient_id,
            doctor_id,
            scheduled_at: slot(),
            reason: Some("checkup".into()),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn reopening_does_not_rerun_migrations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clinic.db");
        SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
        let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();

        let specialties = store
            .read(|tx| tx.list_specialties())
            .await
            .unwrap();
        assert!(specialties.is_empty());
    }

    #[tokio::test]
    async fn active_slot_index_rejects_second_booking() {
        let (_dir, store) = open_store();

        let result = store
            .transaction(|tx| {
                let (doctor_id, patient_id) = seed(tx)?;
                tx.insert_appointment(&booking(doctor_id, patient_id))?;
                tx.insert_appointment(&booking(doctor_id, patient_id))
            })
            .await;

        assert_matches!(result, Err(StoreError::ConstraintViolation(Constraint::ActiveSlot)));

        // The whole transaction rolled back, seed rows included
        let doctors = store.read(|tx| tx.list_doctors(None)).await.unwrap();
        assert!(doctors.is_empty());
    }

    #[tokio::test]
    async fn cancelled_appointment_frees_the_slot() {
        let (_dir, store) = open_store();

        let (first, second) = store
            .transaction(|tx| {
                let (doctor_id, patient_id) = seed(tx)?;
                let first = tx.insert_appointment(&booking(doctor_id, patient_id))?;
                let cancelled = tx.update_appointment(
                    first.id,
                    first.version,
                    &AppointmentChanges {
                        state: Some(AppointmentState::Cancelled),
                        cancelled_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )?;
                let second = tx.insert_appointment(&booking(doctor_id, patient_id))?;
                Ok::<_, StoreError>((cancelled, second))
            })
            .await
            .unwrap();

        assert_eq!(first.state, AppointmentState::Cancelled);
        assert_eq!(first.version, 2);
        assert_eq!(second.state, AppointmentState::Pending);
        assert_eq!(second.scheduled_at, slot());
    }

    #[tokio::test]
    async fn find_conflicting_skips_excluded_and_cancelled() {
        let (_dir, store) = open_store();

        let (own, other) = store
            .transaction(|tx| {
                let (doctor_id, patient_id) = seed(tx)?;
                let appointment = tx.insert_appointment(&booking(doctor_id, patient_id))?;
                let own = tx.find_conflicting(doctor_id, slot(), Some(appointment.id))?;
                let other = tx.find_conflicting(doctor_id, slot(), None)?;
                Ok::<_, StoreError>((own, other.map(|a| a.id == appointment.id)))
            })
            .await
            .unwrap();

        assert!(own.is_none());
        assert_eq!(other, Some(true));
    }

    #[tokio::test]
    async fn stale_version_is_reported() {
        let (_dir, store) = open_store();

        let result = store
            .transaction(|tx| {
                let (doctor_id, _) = seed(tx)?;
                let doctor = tx.find_doctor(doctor_id)?.ok_or_else(|| not_found("doctor", doctor_id))?;
                tx.update_doctor(doctor.id, doctor.version, &DoctorChanges::default())?;
                // Second write still carries the version read before the first
                tx.update_doctor(doctor.id, doctor.version, &DoctorChanges::default())
            })
            .await;

        assert_matches!(result, Err(StoreError::StaleVersion { entity: "doctor", expected: 1, .. }));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let (_dir, store) = open_store();

        let result = store
            .transaction(|tx| tx.update_payment(99, 1, &PaymentChanges::default()))
            .await;

        assert_matches!(result, Err(StoreError::NotFound { entity: "payment", id: 99 }));
    }

    #[tokio::test]
    async fn earliest_upcoming_slot_ignores_cancelled_and_completed() {
        let (_dir, store) = open_store();

        let earliest = store
            .transaction(|tx| {
                let (doctor_id, patient_id) = seed(tx)?;
                let early = tx.insert_appointment(&NewAppointment {
                    scheduled_at: slot() - ChronoDuration::days(1),
                    ..booking(doctor_id, patient_id)
                })?;
                tx.insert_appointment(&booking(doctor_id, patient_id))?;
                tx.update_appointment(
                    early.id,
                    early.version,
                    &AppointmentChanges {
                        state: Some(AppointmentState::Completed),
                        ..Default::default()
                    },
                )?;
                tx.earliest_upcoming_slot(doctor_id)
            })
            .await
            .unwrap();

        assert_eq!(earliest, Some(slot()));
    }

    #[tokio::test]
    async fn audit_log_is_append_only() {
        let (dir, store) = open_store();

        store
            .transaction(|tx| {
                tx.append_audit(&NewAuditRecord {
                    table_name: AuditTable::Users,
                    action: AuditAction::Insert,
                    record_id: 1,
                    before_state: None,
                    after_state: Some(json!({"id": 1})),
                    actor_user_id: None,
                    occurred_at: Utc::now(),
                })
            })
            .await
            .unwrap();

        let conn = Connection::open(dir.path().join("clinic.db")).unwrap();
        assert!(conn.execute("UPDATE audit_log SET record_id = 2", []).is_err());
        assert!(conn.execute("DELETE FROM audit_log", []).is_err());
    }

    #[tokio::test]
    async fn failed_audit_insert_leaves_business_write_intact() {
        let (dir, store) = open_store();
        let conn = Connection::open(dir.path().join("clinic.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER audit_down BEFORE INSERT ON audit_log
             BEGIN SELECT RAISE(ABORT, 'audit store unavailable'); END;",
        )
        .unwrap();

        let audit_failed = store
            .transaction(|tx| {
                tx.insert_specialty(&NewSpecialty {
                    name: "Dermatology".into(),
                    description: None,
                })?;
                let audit = tx.append_audit(&NewAuditRecord {
                    table_name: AuditTable::Specialties,
                    action: AuditAction::Insert,
                    record_id: 1,
                    before_state: None,
                    after_state: None,
                    actor_user_id: None,
                    occurred_at: Utc::now(),
                });
                Ok::<_, StoreError>(audit.is_err())
            })
            .await
            .unwrap();

        assert!(audit_failed);
        let specialties = store.read(|tx| tx.list_specialties()).await.unwrap();
        assert_eq!(specialties.len(), 1);
    }

    #[tokio::test]
    async fn fetch_audit_filters_and_orders() {
        let (_dir, store) = open_store();
        let base = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();

        let records = store
            .transaction(move |tx| {
                for (offset, action) in [(2, AuditAction::Update), (0, AuditAction::Insert), (5, AuditAction::Delete)] {
                    tx.append_audit(&NewAuditRecord {
                        table_name: AuditTable::Appointments,
                        action,
                        record_id: 7,
                        before_state: None,
                        after_state: None,
                        actor_user_id: Some(3),
                        occurred_at: base + ChronoDuration::minutes(offset),
                    })?;
                }
                tx.fetch_audit(&AuditQuery {
                    actions: vec![AuditAction::Update, AuditAction::Delete],
                    order: SortOrder::Descending,
                    ..AuditQuery::for_record(AuditTable::Appointments, 7)
                })
            })
            .await
            .unwrap();

        let actions: Vec<AuditAction> = records.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![AuditAction::Delete, AuditAction::Update]);
        assert_eq!(records[0].occurred_at, base + ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn audit_log_health_reads_guards_and_snapshot_quality() {
        let (dir, store) = open_store();

        let fresh = store.read(|tx| tx.audit_log_health()).await.unwrap();
        assert!(fresh.table_present);
        assert_eq!(fresh.triggers, vec!["audit_log_no_delete".to_string(), "audit_log_no_update".to_string()]);
        assert_eq!(fresh.indexes.len(), 3);
        assert_eq!(fresh.total, 0);

        store
            .transaction(|tx| {
                tx.append_audit(&NewAuditRecord {
                    table_name: AuditTable::Users,
                    action: AuditAction::Insert,
                    record_id: 1,
                    before_state: None,
                    after_state: Some(json!({"id": 1})),
                    actor_user_id: Some(4),
                    occurred_at: Utc::now(),
                })
            })
            .await
            .unwrap();

        // Written around the store, the way a broken importer would
        let conn = Connection::open(dir.path().join("clinic.db")).unwrap();
        conn.execute(
            "INSERT INTO audit_log (table_name, action, record_id, before_state, after_state, actor_user_id, occurred_at)
             VALUES ('users', 'update', 1, '{not json', NULL, NULL, ?1)",
            [ts(&Utc::now())],
        )
        .unwrap();

        let health = store.read(|tx| tx.audit_log_health()).await.unwrap();
        assert_eq!(health.total, 2);
        assert_eq!(health.with_actor, 1);
        assert_eq!(health.unparseable_snapshots, 1);
        assert_eq!(health.missing_snapshots, 1);
        assert_eq!(
            health.counts,
            vec![
                AuditCount { table_name: "users".into(), action: "insert".into(), count: 1 },
                AuditCount { table_name: "users".into(), action: "update".into(), count: 1 },
            ]
        );
    }
}
