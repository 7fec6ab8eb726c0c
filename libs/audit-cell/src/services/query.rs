// =====================================================================================
// AUDIT QUERY SERVICE - READ-ONLY HISTORY RECONSTRUCTION
// =====================================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use shared_database::{AuditLogHealth, AuditQuery, EntityStore, SortOrder};
use shared_models::clinic::{AppointmentState, AuditAction, AuditRecord, AuditTable};

use crate::models::{
    Anomaly, AppointmentSummary, AuditChange, AuditError, AuditStats, AuditValidation, CreationEvent,
    PreviousState, RecordCount, StateChange, TableActionStats, ValidationCheck,
};
use crate::services::retry::AuditRetryHandle;

pub const DEFAULT_RECENT_LIMIT: i64 = 50;
pub const DEFAULT_ACTOR_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;
pub const ANOMALY_WINDOW_HOURS: i64 = 24;
pub const STATS_WINDOW_DAYS: i64 = 7;

pub const AUDIT_TRIGGERS: [&str; 2] = ["audit_log_no_update", "audit_log_no_delete"];
pub const AUDIT_INDEXES: [&str; 3] = ["ix_audit_record", "ix_audit_actor", "ix_audit_occurred"];

/// Bookkeeping columns that change on every update.
const IGNORED_DIFF_FIELDS: [&str; 2] = ["version", "updated_at"];

#[derive(Clone)]
pub struct AuditQueryService<S: EntityStore> {
    store: S,
}

impl<S: EntityStore> AuditQueryService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn fetch(&self, query: AuditQuery) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.store.read(move |tx| tx.fetch_audit(&query)).await?)
    }

    /// Full lifecycle of one record, oldest first.
    #[instrument(skip(self))]
    pub async fn get_trail(&self, table: AuditTable, record_id: i64) -> Result<Vec<AuditRecord>, AuditError> {
        let trail = self.fetch(AuditQuery::for_record(table, record_id)).await?;
        debug!("Audit trail for {} {} has {} entries", table, record_id, trail.len());
        Ok(trail)
    }

    /// Most recent records of a table, newest first.
    #[instrument(skip(self))]
    pub async fn get_recent(&self, table: AuditTable, limit: Option<i64>) -> Result<Vec<AuditRecord>, AuditError> {
        let limit = validate_limit(limit, DEFAULT_RECENT_LIMIT)?;
        self.fetch(AuditQuery {
            table: Some(table),
            order: SortOrder::Descending,
            limit: Some(limit),
            ..AuditQuery::default()
        })
        .await
    }

    /// Updates and deletes of one record, newest first, with the fields each touched.
    #[instrument(skip(self))]
    pub async fn get_changes(&self, table: AuditTable, record_id: i64) -> Result<Vec<AuditChange>, AuditError> {
        let records = self
            .fetch(AuditQuery {
                actions: vec![AuditAction::Update, AuditAction::Delete],
                order: SortOrder::Descending,
                ..AuditQuery::for_record(table, record_id)
            })
            .await?;

        Ok(records
            .into_iter()
            .map(|record| AuditChange {
                changed_fields: changed_fields(record.before_state.as_ref(), record.after_state.as_ref()),
                audit_id: record.id,
                action: record.action,
                record_id: record.record_id,
                actor_user_id: record.actor_user_id,
                occurred_at: record.occurred_at,
                before: record.before_state,
                after: record.after_state,
            })
            .collect())
    }

    /// Everything one user did, newest first.
    #[instrument(skip(self))]
    pub async fn get_by_actor(&self, user_id: i64, limit: Option<i64>) -> Result<Vec<AuditRecord>, AuditError> {
        let limit = validate_limit(limit, DEFAULT_ACTOR_LIMIT)?;
        self.fetch(AuditQuery {
            actor_user_id: Some(user_id),
            order: SortOrder::Descending,
            limit: Some(limit),
            ..AuditQuery::default()
        })
        .await
    }

    /// Flags (actor, table, minute) buckets of the last 24 hours holding more
    /// than `threshold` mutations. Busiest buckets first.
    #[instrument(skip(self))]
    pub async fn detect_anomalies(&self, threshold: i64) -> Result<Vec<Anomaly>, AuditError> {
        if threshold < 0 {
            return Err(AuditError::InvalidQuery("threshold must not be negative".to_string()));
        }

        let since = Utc::now() - Duration::hours(ANOMALY_WINDOW_HOURS);
        let records = self
            .fetch(AuditQuery {
                since: Some(since),
                ..AuditQuery::default()
            })
            .await?;

        let mut buckets: HashMap<(Option<i64>, AuditTable, DateTime<Utc>), i64> = HashMap::new();
        for record in &records {
            let minute = truncate_to_minute(record.occurred_at);
            *buckets.entry((record.actor_user_id, record.table_name, minute)).or_insert(0) += 1;
        }

        let mut anomalies: Vec<Anomaly> = buckets
            .into_iter()
            .filter(|(_, count)| *count > threshold)
            .map(|((actor_user_id, table_name, minute), mutation_count)| Anomaly {
                actor_user_id,
                table_name,
                minute,
                mutation_count,
            })
            .collect();

        anomalies.sort_by(|a, b| {
            b.mutation_count
                .cmp(&a.mutation_count)
                .then(a.minute.cmp(&b.minute))
                .then(a.table_name.as_str().cmp(b.table_name.as_str()))
        });

        if !anomalies.is_empty() {
            info!("Detected {} audit anomalies above threshold {}", anomalies.len(), threshold);
        }
        Ok(anomalies)
    }

    /// Per table and action counts over the last seven days.
    #[instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<AuditStats, AuditError> {
        let since = Utc::now() - Duration::days(STATS_WINDOW_DAYS);
        let records = self
            .fetch(AuditQuery {
                since: Some(since),
                ..AuditQuery::default()
            })
            .await?;

        let mut grouped: HashMap<(AuditTable, AuditAction), TableActionStats> = HashMap::new();
        for record in &records {
            grouped
                .entry((record.table_name, record.action))
                .and_modify(|stats| {
                    stats.count += 1;
                    stats.first_at = stats.first_at.min(record.occurred_at);
                    stats.last_at = stats.last_at.max(record.occurred_at);
                })
                .or_insert(TableActionStats {
                    table_name: record.table_name,
                    action: record.action,
                    count: 1,
                    first_at: record.occurred_at,
                    last_at: record.occurred_at,
                });
        }

        let mut by_table: Vec<TableActionStats> = grouped.into_values().collect();
        by_table.sort_by(|a, b| {
            a.table_name
                .as_str()
                .cmp(b.table_name.as_str())
                .then(a.action.as_str().cmp(b.action.as_str()))
        });

        Ok(AuditStats {
            window_days: STATS_WINDOW_DAYS,
            total: records.len() as i64,
            by_table,
        })
    }

    /// The before-snapshot of the latest update or delete strictly earlier than
    /// `before` (or the latest overall). `None` if the record never changed.
    #[instrument(skip(self))]
    pub async fn get_previous_state(
        &self,
        table: AuditTable,
        record_id: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<PreviousState>, AuditError> {
        let mut records = self
            .fetch(AuditQuery {
                actions: vec![AuditAction::Update, AuditAction::Delete],
                until: before,
                order: SortOrder::Descending,
                limit: Some(1),
                ..AuditQuery::for_record(table, record_id)
            })
            .await?;

        Ok(records.pop().map(|record| PreviousState {
            table_name: record.table_name,
            record_id: record.record_id,
            state: record.before_state,
            action: record.action,
            occurred_at: record.occurred_at,
        }))
    }

    /// Records of a table on the given UTC days (both inclusive), newest first.
    #[instrument(skip(self))]
    pub async fn get_by_date_range(
        &self,
        table: AuditTable,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        if from > to {
            return Err(AuditError::InvalidQuery(format!("from date {} is after to date {}", from, to)));
        }

        let since = from.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        let until = to
            .succ_opt()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc());

        self.fetch(AuditQuery {
            table: Some(table),
            since,
            until,
            order: SortOrder::Descending,
            ..AuditQuery::default()
        })
        .await
    }

    /// Collapses an appointment's trail into creation, state transitions and
    /// whether it ended up cancelled.
    #[instrument(skip(self))]
    pub async fn get_appointment_summary(&self, appointment_id: i64) -> Result<AppointmentSummary, AuditError> {
        let trail = self.get_trail(AuditTable::Appointments, appointment_id).await?;
        Ok(summarize_appointment(appointment_id, trail))
    }

    /// Checks the log's guards and stored data, plus the delivery backlog held by `retry`.
    #[instrument(skip(self, retry))]
    pub async fn validate(&self, retry: &AuditRetryHandle) -> Result<AuditValidation, AuditError> {
        let health = self.store.read(|tx| tx.audit_log_health()).await?;
        let report = evaluate_health(health, retry.dead_letters().len(), retry.pending());

        if report.is_valid {
            info!("Audit log validated over {} records", report.total_records);
        } else {
            let failed: Vec<&str> = report
                .checks
                .iter()
                .filter(|check| !check.passed)
                .map(|check| check.name.as_str())
                .collect();
            warn!(failed = ?failed, "Audit log validation failed");
        }
        Ok(report)
    }
}

pub fn evaluate_health(health: AuditLogHealth, dead_letters: usize, pending_retries: usize) -> AuditValidation {
    let missing = |expected: &[&str], present: &[String]| -> Vec<String> {
        expected
            .iter()
            .filter(|name| !present.iter().any(|p| p == *name))
            .map(|name| name.to_string())
            .collect()
    };
    let check = |name: &str, passed: bool, detail: String| ValidationCheck {
        name: name.to_string(),
        passed,
        detail,
    };

    let missing_triggers = missing(&AUDIT_TRIGGERS, &health.triggers);
    let missing_indexes = missing(&AUDIT_INDEXES, &health.indexes);
    let unknown: Vec<String> = health
        .counts
        .iter()
        .filter(|c| c.table_name.parse::<AuditTable>().is_err() || c.action.parse::<AuditAction>().is_err())
        .map(|c| format!("{}/{}", c.table_name, c.action))
        .collect();

    let checks = vec![
        check(
            "audit_table",
            health.table_present,
            if health.table_present { "audit_log exists".to_string() } else { "audit_log is missing".to_string() },
        ),
        check(
            "append_only_triggers",
            missing_triggers.is_empty(),
            describe_missing("triggers", &missing_triggers),
        ),
        check("indexes", missing_indexes.is_empty(), describe_missing("indexes", &missing_indexes)),
        check(
            "known_tables_and_actions",
            unknown.is_empty(),
            if unknown.is_empty() {
                "every record names an audited table and action".to_string()
            } else {
                format!("unexpected entries: {}", unknown.join(", "))
            },
        ),
        check(
            "snapshots",
            health.unparseable_snapshots == 0 && health.missing_snapshots == 0,
            format!(
                "{} unparseable, {} missing",
                health.unparseable_snapshots, health.missing_snapshots
            ),
        ),
        check(
            "delivery",
            dead_letters == 0,
            format!("{} dead letters, {} pending retries", dead_letters, pending_retries),
        ),
    ];

    let tables_without_records = AuditTable::ALL
        .into_iter()
        .filter(|table| !health.counts.iter().any(|c| c.table_name == table.as_str()))
        .collect();

    let actor_coverage = if health.total == 0 {
        1.0
    } else {
        health.with_actor as f64 / health.total as f64
    };

    AuditValidation {
        is_valid: checks.iter().all(|c| c.passed),
        checks,
        total_records: health.total,
        by_table: health
            .counts
            .into_iter()
            .map(|c| RecordCount {
                table_name: c.table_name,
                action: c.action,
                count: c.count,
            })
            .collect(),
        tables_without_records,
        actor_coverage,
        unparseable_snapshots: health.unparseable_snapshots,
        missing_snapshots: health.missing_snapshots,
        dead_letters,
        pending_retries,
    }
}

fn describe_missing(what: &str, missing: &[String]) -> String {
    if missing.is_empty() {
        format!("all {} present", what)
    } else {
        format!("missing {}: {}", what, missing.join(", "))
    }
}

pub fn summarize_appointment(appointment_id: i64, trail: Vec<AuditRecord>) -> AppointmentSummary {
    let mut created = None;
    let mut state_changes = Vec::new();
    let mut last_update = None;
    let mut was_cancelled = false;
    let cancelled = AppointmentState::Cancelled.as_str();

    for record in &trail {
        match record.action {
            AuditAction::Insert => {
                created = Some(CreationEvent {
                    occurred_at: record.occurred_at,
                    actor_user_id: record.actor_user_id,
                    state: state_field(record.after_state.as_ref()),
                });
            }
            AuditAction::Update => {
                let from = state_field(record.before_state.as_ref());
                let to = state_field(record.after_state.as_ref());
                last_update = Some(record.occurred_at);

                if from != to {
                    if to.as_deref() == Some(cancelled) {
                        was_cancelled = true;
                    }
                    state_changes.push(StateChange {
                        from,
                        to,
                        occurred_at: record.occurred_at,
                        actor_user_id: record.actor_user_id,
                    });
                }
            }
            AuditAction::Delete => {}
        }
    }

    AppointmentSummary {
        appointment_id,
        created,
        state_changes,
        total_changes: trail.len(),
        last_update,
        was_cancelled,
        trail,
    }
}

fn state_field(snapshot: Option<&Value>) -> Option<String> {
    snapshot
        .and_then(|value| value.get("state"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Top-level fields whose value differs between two snapshots.
pub fn changed_fields(before: Option<&Value>, after: Option<&Value>) -> Vec<String> {
    let empty = serde_json::Map::new();
    let before = before.and_then(Value::as_object).unwrap_or(&empty);
    let after = after.and_then(Value::as_object).unwrap_or(&empty);

    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|key| !IGNORED_DIFF_FIELDS.contains(&key.as_str()))
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect()
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn validate_limit(limit: Option<i64>, default: i64) -> Result<i64, AuditError> {
    match limit {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n.min(MAX_LIMIT)),
        Some(n) => Err(AuditError::InvalidQuery(format!("limit must be positive, got {}", n))),
    }
}
