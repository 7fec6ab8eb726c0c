// libs/appointment-cell/src/services/retry.rs
use std::time::Duration;

use tracing::{error, warn};

use audit_cell::{AuditRecorder, AuditedTx};
use shared_config::AppConfig;
use shared_database::EntityStore;

use crate::models::SchedulingError;

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// How often a write is retried after the store reports a transient failure.
///
/// `attempts` counts retries after the first try; the n-th retry waits
/// `backoff * n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.transient_retry_attempts,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Runs `op` in an audited transaction, retrying transient store failures
/// with linear backoff. Every try is a fresh transaction.
pub async fn run_with_retry<S, T, F>(
    recorder: &AuditRecorder<S>,
    policy: RetryPolicy,
    operation: &'static str,
    actor_user_id: Option<i64>,
    op: F,
) -> Result<T, SchedulingError>
where
    S: EntityStore,
    F: FnOnce(&mut AuditedTx<'_>) -> Result<T, SchedulingError> + Clone + Send + 'static,
    T: Send + 'static,
{
    let mut retries = 0;
    loop {
        match recorder.run(actor_user_id, op.clone()).await {
            Err(err) if err.is_retryable() && retries < policy.attempts => {
                retries += 1;
                warn!(operation, retry = retries, error = %err, "Transient store error, retrying");
                tokio::time::sleep(policy.backoff * retries).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    error!(operation, retries, error = %err, "Store still unavailable after retries");
                }
                return Err(err);
            }
            Ok(value) => return Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_follows_config() {
        let config = AppConfig {
            transient_retry_attempts: 4,
            ..AppConfig::default()
        };
        let policy = RetryPolicy::from_config(&config).with_backoff(Duration::from_millis(7));
        assert_eq!(policy.attempts, 4);
        assert_eq!(policy.backoff * 2, Duration::from_millis(14));
    }
}
