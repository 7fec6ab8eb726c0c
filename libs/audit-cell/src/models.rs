// =====================================================================================
// AUDIT CELL MODELS
// =====================================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use shared_database::{NewAuditRecord, StoreError};
use shared_models::clinic::{AuditAction, AuditRecord, AuditTable};
use shared_models::error::AppError;

// =====================================================================================
// QUERY RESULTS
// =====================================================================================

/// An update or delete with the fields it touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditChange {
    pub audit_id: i64,
    pub action: AuditAction,
    pub record_id: i64,
    pub actor_user_id: Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changed_fields: Vec<String>,
}

/// A burst of mutations by one actor on one table inside one minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub actor_user_id: Option<i64>,
    pub table_name: AuditTable,
    pub minute: DateTime<Utc>,
    pub mutation_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableActionStats {
    pub table_name: AuditTable,
    pub action: AuditAction,
    pub count: i64,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub window_days: i64,
    pub total: i64,
    pub by_table: Vec<TableActionStats>,
}

/// Snapshot of a record as it was before a given change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousState {
    pub table_name: AuditTable,
    pub record_id: i64,
    pub state: Option<Value>,
    pub action: AuditAction,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationEvent {
    pub occurred_at: DateTime<Utc>,
    pub actor_user_id: Option<i64>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: Option<String>,
    pub to: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub actor_user_id: Option<i64>,
}

/// One appointment's trail collapsed into its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentSummary {
    pub appointment_id: i64,
    pub created: Option<CreationEvent>,
    pub state_changes: Vec<StateChange>,
    pub total_changes: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub was_cancelled: bool,
    pub trail: Vec<AuditRecord>,
}

/// Outcome of one integrity check over the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCount {
    pub table_name: String,
    pub action: String,
    pub count: i64,
}

/// Integrity report for the audit log: its guards, its data and delivery backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditValidation {
    pub is_valid: bool,
    pub checks: Vec<ValidationCheck>,
    pub total_records: i64,
    pub by_table: Vec<RecordCount>,
    /// Audited tables with no record yet. Informational.
    pub tables_without_records: Vec<AuditTable>,
    /// Share of records naming an actor, 0.0 to 1.0. System jobs record none.
    pub actor_coverage: f64,
    pub unparseable_snapshots: i64,
    pub missing_snapshots: i64,
    pub dead_letters: usize,
    pub pending_retries: usize,
}

/// An audit record whose delivery retries ran out.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub table_name: AuditTable,
    pub action: AuditAction,
    pub record_id: i64,
    pub actor_user_id: Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    #[serde(skip)]
    pub record: NewAuditRecord,
}

// =====================================================================================
// ERRORS
// =====================================================================================

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Table {0} is not audited")]
    UnknownTable(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<StoreError> for AuditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => AuditError::TransientStore(msg),
            other => AuditError::Store(other.to_string()),
        }
    }
}

impl From<AuditError> for AppError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::UnknownTable(_) | AuditError::InvalidQuery(_) => {
                AppError::ValidationError(err.to_string())
            }
            AuditError::TransientStore(msg) => AppError::Unavailable(msg),
            AuditError::Store(msg) => AppError::Database(msg),
        }
    }
}

/// Parses a table name from a request path, accepting only audited tables.
pub fn parse_table(raw: &str) -> Result<AuditTable, AuditError> {
    raw.parse()
        .map_err(|_| AuditError::UnknownTable(raw.to_string()))
}
