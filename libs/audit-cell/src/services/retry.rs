// =====================================================================================
// AUDIT RETRY WORKER - AT-LEAST-ONCE REDELIVERY
// =====================================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use shared_database::{EntityStore, NewAuditRecord};

use crate::models::DeadLetter;

/// Cheap, cloneable side of the retry queue.
#[derive(Clone)]
pub struct AuditRetryHandle {
    sender: mpsc::UnboundedSender<NewAuditRecord>,
    shutdown: Arc<watch::Sender<bool>>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    queued: Arc<AtomicUsize>,
}

impl AuditRetryHandle {
    /// Queues a record for redelivery. Never blocks.
    pub fn enqueue(&self, record: NewAuditRecord) {
        self.queued.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(record)) = self.sender.send(record) {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            error!(
                target: "audit_alert",
                table = %record.table_name,
                record_id = record.record_id,
                action = %record.action,
                "Audit retry worker is not running; record kept in dead-letter list"
            );
            push_dead_letter(&self.dead_letters, record, 0, "retry worker not running".to_string());
        }
    }

    /// Records queued or in flight.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        match self.dead_letters.lock() {
            Ok(letters) => letters.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Asks the worker to drain its queue once and stop.
    pub fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            debug!("Audit retry worker already stopped");
        }
    }
}

enum Next {
    Record(NewAuditRecord),
    Continue,
    Stop,
}

pub struct AuditRetryWorker<S: EntityStore> {
    store: S,
    receiver: mpsc::UnboundedReceiver<NewAuditRecord>,
    shutdown: watch::Receiver<bool>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    queued: Arc<AtomicUsize>,
    max_attempts: u32,
    base_delay: Duration,
}

impl<S: EntityStore> AuditRetryWorker<S> {
    pub fn new(store: S, max_attempts: u32, base_delay: Duration) -> (AuditRetryHandle, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dead_letters = Arc::new(Mutex::new(Vec::new()));
        let queued = Arc::new(AtomicUsize::new(0));

        let handle = AuditRetryHandle {
            sender,
            shutdown: Arc::new(shutdown_tx),
            dead_letters: Arc::clone(&dead_letters),
            queued: Arc::clone(&queued),
        };

        let worker = Self {
            store,
            receiver,
            shutdown: shutdown_rx,
            dead_letters,
            queued,
            max_attempts: max_attempts.max(1),
            base_delay,
        };

        (handle, worker)
    }

    #[instrument(skip_all)]
    pub async fn run(mut self) {
        info!("Audit retry worker started (max {} attempts)", self.max_attempts);

        loop {
            let next = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() { Next::Stop } else { Next::Continue }
                }
                record = self.receiver.recv() => {
                    record.map(Next::Record).unwrap_or(Next::Stop)
                }
            };

            match next {
                Next::Record(record) => self.deliver(record).await,
                Next::Continue => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Next::Stop => break,
            }
        }

        // Drain whatever was queued before shutdown
        while let Ok(record) = self.receiver.try_recv() {
            self.deliver(record).await;
        }

        info!("Audit retry worker stopped");
    }

    async fn deliver(&self, record: NewAuditRecord) {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let candidate = record.clone();
            match self.store.transaction(move |tx| tx.append_audit(&candidate)).await {
                Ok(written) => {
                    info!(
                        audit_id = written.id,
                        table = %record.table_name,
                        record_id = record.record_id,
                        attempt,
                        "Deferred audit record delivered"
                    );
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(
                        table = %record.table_name,
                        record_id = record.record_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Audit redelivery failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.base_delay * attempt).await;
                    }
                }
            }
        }

        error!(
            target: "audit_alert",
            table = %record.table_name,
            record_id = record.record_id,
            action = %record.action,
            attempts = self.max_attempts,
            error = %last_error,
            "Audit record could not be delivered; kept in dead-letter list"
        );
        push_dead_letter(&self.dead_letters, record, self.max_attempts, last_error);
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

fn push_dead_letter(
    dead_letters: &Mutex<Vec<DeadLetter>>,
    record: NewAuditRecord,
    attempts: u32,
    last_error: String,
) {
    let letter = DeadLetter {
        table_name: record.table_name,
        action: record.action,
        record_id: record.record_id,
        actor_user_id: record.actor_user_id,
        occurred_at: record.occurred_at,
        attempts,
        last_error,
        record,
    };

    match dead_letters.lock() {
        Ok(mut letters) => letters.push(letter),
        Err(poisoned) => poisoned.into_inner().push(letter),
    }
}
