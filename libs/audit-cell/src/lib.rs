// =====================================================================================
// AUDIT CELL - APPEND-ONLY CHANGE HISTORY
// =====================================================================================
//
// Recording: every mutation of an audited table goes through `AuditedTx`, which
// writes a before/after snapshot inside the same store transaction. Writes that
// fail are handed to the retry worker after commit.
//
// Querying: read-only reconstruction of the log (trails, diffs, anomalies,
// point-in-time state, appointment summaries) and an integrity report.
//
// =====================================================================================

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use models::{
    Anomaly, AppointmentSummary, AuditChange, AuditError, AuditStats, AuditValidation,
    CreationEvent, DeadLetter, PreviousState, RecordCount, StateChange, TableActionStats,
    ValidationCheck,
};

pub use services::{AuditQueryService, AuditRecorder, AuditRetryHandle, AuditRetryWorker, AuditedTx};

pub use router::audit_routes;
