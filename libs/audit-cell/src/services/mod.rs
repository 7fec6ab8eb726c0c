pub mod query;
pub mod recorder;
pub mod retry;

pub use query::AuditQueryService;
pub use recorder::{AuditRecorder, AuditedTx};
pub use retry::{AuditRetryHandle, AuditRetryWorker};
