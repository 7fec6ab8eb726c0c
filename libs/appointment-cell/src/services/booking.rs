// libs/appointment-cell/src/services/booking.rs
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{debug, error, info, instrument};

use audit_cell::{AuditRecorder, AuditedTx};
use shared_config::AppConfig;
use shared_database::{
    AppointmentChanges, AppointmentFilter, DoctorChanges, EntityStore, NewAppointment,
    PatientChanges, PaymentChanges, StoreTransaction,
};
use shared_models::auth::Actor;
use shared_models::clinic::{Appointment, AppointmentState, Doctor, Patient, PaymentState};

use crate::models::{AppointmentSearchQuery, BookAppointmentRequest, SchedulingError};
use crate::services::conflict::ensure_slot_free;
use crate::services::lifecycle::{ensure_editable, next_state, LifecycleAction};
use crate::services::retry::{run_with_retry, RetryPolicy};

pub const MAX_REASON_CHARS: usize = 500;
pub const EXPIRED_NOTE: &str = "Expired: not confirmed in time";

/// Executes appointment lifecycle operations as single audited transactions.
///
/// Every operation either commits all of its effects (appointment row,
/// patient counter, doctor slot bookkeeping, payment) or none of them.
#[derive(Clone)]
pub struct SchedulingEngine<S: EntityStore> {
    recorder: AuditRecorder<S>,
    pending_ttl: Duration,
    retry: RetryPolicy,
}

impl<S: EntityStore> SchedulingEngine<S> {
    pub fn new(recorder: AuditRecorder<S>, config: &AppConfig) -> Self {
        Self {
            recorder,
            pending_ttl: config.pending_ttl(),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: StdDuration) -> Self {
        self.retry = self.retry.with_backoff(backoff);
        self
    }

    pub fn recorder(&self) -> &AuditRecorder<S> {
        &self.recorder
    }

    async fn execute<T, F>(&self, operation: &'static str, actor_user_id: Option<i64>, op: F) -> Result<T, SchedulingError>
    where
        F: FnOnce(&mut AuditedTx<'_>) -> Result<T, SchedulingError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        run_with_retry(&self.recorder, self.retry, operation, actor_user_id, op).await
    }

    async fn read<T, F>(&self, op: F) -> Result<T, SchedulingError>
    where
        F: FnOnce(&dyn StoreTransaction) -> Result<T, SchedulingError> + Send + 'static,
        T: Send + 'static,
    {
        self.recorder.store().read(op).await
    }

    // ==============================================================================
    // LIFECYCLE OPERATIONS
    // ==============================================================================

    #[instrument(skip(self, actor, request), fields(patient_id = request.patient_id, doctor_id = request.doctor_id))]
    pub async fn book(&self, actor: &Actor, request: BookAppointmentRequest) -> Result<Appointment, SchedulingError> {
        debug!("Booking appointment at {}", request.scheduled_at);
        validate_booking(&request, Utc::now())?;

        let ttl = self.pending_ttl;
        let appointment = self
            .execute("book", Some(actor.user_id), move |tx| {
                let now = Utc::now();
                let patient = load_patient(tx, request.patient_id)?;
                let doctor = load_doctor(tx, request.doctor_id)?;
                if !doctor.is_active() {
                    return Err(SchedulingError::DoctorInactive(doctor.id));
                }

                ensure_slot_free(&**tx, doctor.id, request.scheduled_at, None)?;

                let appointment = tx.insert_appointment(&NewAppointment {
                    patient_id: patient.id,
                    doctor_id: doctor.id,
                    scheduled_at: request.scheduled_at,
                    reason: request.reason.clone(),
                    expires_at: Some(now + ttl),
                })?;

                adjust_patient(tx, &patient, 1, Some(now))?;
                refresh_doctor(tx, doctor.id, Some(now))?;

                Ok(appointment)
            })
            .await?;

        info!(
            appointment_id = appointment.id,
            "Appointment booked for patient {} with doctor {} at {}",
            appointment.patient_id, appointment.doctor_id, appointment.scheduled_at
        );
        Ok(appointment)
    }

    #[instrument(skip(self, actor, reason))]
    pub async fn cancel(
        &self,
        actor: &Actor,
        appointment_id: i64,
        reason: Option<String>,
    ) -> Result<Appointment, SchedulingError> {
        let reason = reason.unwrap_or_default();
        validate_reason(&reason)?;
        let note = cancellation_note(&reason);

        let appointment = self
            .execute("cancel", Some(actor.user_id), move |tx| {
                let appointment = load_appointment(tx, appointment_id)?;
                cancel_in_tx(tx, appointment, note, Utc::now())
            })
            .await?;

        info!(appointment_id, "Appointment cancelled");
        Ok(appointment)
    }

    #[instrument(skip(self, actor))]
    pub async fn reassign(
        &self,
        actor: &Actor,
        appointment_id: i64,
        new_doctor_id: i64,
    ) -> Result<Appointment, SchedulingError> {
        let appointment = self
            .execute("reassign", Some(actor.user_id), move |tx| {
                let appointment = load_appointment(tx, appointment_id)?;
                ensure_editable(appointment_id, appointment.state, "reassign")?;
                if appointment.doctor_id == new_doctor_id {
                    return Err(SchedulingError::ValidationError(format!(
                        "appointment {} is already assigned to doctor {}",
                        appointment_id, new_doctor_id
                    )));
                }

                let doctor = load_doctor(tx, new_doctor_id)?;
                if !doctor.is_active() {
                    return Err(SchedulingError::DoctorInactive(doctor.id));
                }

                ensure_slot_free(&**tx, new_doctor_id, appointment.scheduled_at, Some(appointment_id))?;

                let now = Utc::now();
                let moved = tx.update_appointment(
                    appointment_id,
                    appointment.version,
                    &AppointmentChanges {
                        doctor_id: Some(new_doctor_id),
                        ..AppointmentChanges::default()
                    },
                )?;

                refresh_doctor(tx, appointment.doctor_id, None)?;
                refresh_doctor(tx, new_doctor_id, Some(now))?;
                let patient = load_patient(tx, appointment.patient_id)?;
                adjust_patient(tx, &patient, 0, Some(now))?;

                Ok(moved)
            })
            .await?;

        info!(appointment_id, "Appointment reassigned to doctor {}", new_doctor_id);
        Ok(appointment)
    }

    #[instrument(skip(self, actor))]
    pub async fn confirm(&self, actor: &Actor, appointment_id: i64) -> Result<Appointment, SchedulingError> {
        let appointment = self
            .execute("confirm", Some(actor.user_id), move |tx| {
                let appointment = load_appointment(tx, appointment_id)?;
                let next = next_state(appointment_id, appointment.state, LifecycleAction::Confirm)?;

                Ok(tx.update_appointment(
                    appointment_id,
                    appointment.version,
                    &AppointmentChanges {
                        state: Some(next),
                        expires_at: Some(None),
                        ..AppointmentChanges::default()
                    },
                )?)
            })
            .await?;

        info!(appointment_id, "Appointment confirmed");
        Ok(appointment)
    }

    #[instrument(skip(self, actor))]
    pub async fn complete(&self, actor: &Actor, appointment_id: i64) -> Result<Appointment, SchedulingError> {
        let appointment = self
            .execute("complete", Some(actor.user_id), move |tx| {
                let appointment = load_appointment(tx, appointment_id)?;
                let next = next_state(appointment_id, appointment.state, LifecycleAction::Complete)?;

                let completed = tx.update_appointment(
                    appointment_id,
                    appointment.version,
                    &AppointmentChanges {
                        state: Some(next),
                        ..AppointmentChanges::default()
                    },
                )?;
                refresh_doctor(tx, appointment.doctor_id, None)?;

                Ok(completed)
            })
            .await?;

        info!(appointment_id, "Appointment completed");
        Ok(appointment)
    }

    #[instrument(skip(self, actor, notes))]
    pub async fn update_notes(
        &self,
        actor: &Actor,
        appointment_id: i64,
        notes: Option<String>,
    ) -> Result<Appointment, SchedulingError> {
        self.execute("update_notes", Some(actor.user_id), move |tx| {
            let appointment = load_appointment(tx, appointment_id)?;
            ensure_editable(appointment_id, appointment.state, "edit notes of")?;

            Ok(tx.update_appointment(
                appointment_id,
                appointment.version,
                &AppointmentChanges {
                    notes: Some(notes),
                    ..AppointmentChanges::default()
                },
            )?)
        })
        .await
    }

    /// Cancels pending appointments whose confirmation window closed at or before `now`.
    ///
    /// Each appointment is expired in its own transaction; one failure does not
    /// stop the sweep.
    #[instrument(skip(self))]
    pub async fn expire_pending(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, SchedulingError> {
        let due = self
            .read(move |tx| {
                Ok(tx.list_appointments(&AppointmentFilter {
                    state: Some(AppointmentState::Pending),
                    expiring_at_or_before: Some(now),
                    ..AppointmentFilter::default()
                })?)
            })
            .await?;

        if due.is_empty() {
            return Ok(Vec::new());
        }
        debug!("{} pending appointments past their confirmation window", due.len());

        let mut expired = Vec::with_capacity(due.len());
        for candidate in due {
            let appointment_id = candidate.id;
            let result = self
                .execute("expire", None, move |tx| {
                    let appointment = load_appointment(tx, appointment_id)?;
                    // Confirmed or cancelled since the sweep read it
                    let still_due = appointment.state == AppointmentState::Pending
                        && appointment.expires_at.is_some_and(|at| at <= now);
                    if !still_due {
                        return Ok(None);
                    }
                    cancel_in_tx(tx, appointment, EXPIRED_NOTE.to_string(), now).map(Some)
                })
                .await;

            match result {
                Ok(Some(appointment)) => expired.push(appointment),
                Ok(None) => debug!(appointment_id, "Appointment no longer due for expiry"),
                Err(e) => error!(appointment_id, error = %e, "Failed to expire pending appointment"),
            }
        }

        if !expired.is_empty() {
            info!("Expired {} unconfirmed appointments", expired.len());
        }
        Ok(expired)
    }

    // ==============================================================================
    // READS
    // ==============================================================================

    pub async fn get(&self, appointment_id: i64) -> Result<Appointment, SchedulingError> {
        self.read(move |tx| {
            tx.find_appointment(appointment_id)?
                .ok_or_else(|| SchedulingError::not_found("appointment", appointment_id))
        })
        .await
    }

    /// Appointments matching the filter, ordered by `scheduled_at`.
    pub async fn list(&self, query: AppointmentSearchQuery) -> Result<Vec<Appointment>, SchedulingError> {
        self.read(move |tx| {
            Ok(tx.list_appointments(&AppointmentFilter {
                patient_id: query.patient_id,
                doctor_id: query.doctor_id,
                state: query.state,
                ..AppointmentFilter::default()
            })?)
        })
        .await
    }

    pub async fn find_patient(&self, patient_id: i64) -> Result<Patient, SchedulingError> {
        self.read(move |tx| {
            tx.find_patient(patient_id)?
                .ok_or_else(|| SchedulingError::not_found("patient", patient_id))
        })
        .await
    }

    pub async fn find_doctor(&self, doctor_id: i64) -> Result<Doctor, SchedulingError> {
        self.read(move |tx| {
            tx.find_doctor(doctor_id)?
                .ok_or_else(|| SchedulingError::not_found("doctor", doctor_id))
        })
        .await
    }
}

// ==============================================================================
// IN-TRANSACTION STEPS
// ==============================================================================

fn load_appointment(tx: &AuditedTx<'_>, id: i64) -> Result<Appointment, SchedulingError> {
    tx.find_appointment(id)?
        .ok_or_else(|| SchedulingError::not_found("appointment", id))
}

fn load_patient(tx: &AuditedTx<'_>, id: i64) -> Result<Patient, SchedulingError> {
    tx.find_patient(id)?
        .ok_or_else(|| SchedulingError::not_found("patient", id))
}

fn load_doctor(tx: &AuditedTx<'_>, id: i64) -> Result<Doctor, SchedulingError> {
    tx.find_doctor(id)?
        .ok_or_else(|| SchedulingError::not_found("doctor", id))
}

/// Shared by explicit cancellation and expiry.
fn cancel_in_tx(
    tx: &mut AuditedTx<'_>,
    appointment: Appointment,
    note: String,
    now: DateTime<Utc>,
) -> Result<Appointment, SchedulingError> {
    let next = next_state(appointment.id, appointment.state, LifecycleAction::Cancel)?;

    let cancelled = tx.update_appointment(
        appointment.id,
        appointment.version,
        &AppointmentChanges {
            state: Some(next),
            notes: Some(Some(note)),
            cancelled_at: Some(Some(now)),
            expires_at: Some(None),
            ..AppointmentChanges::default()
        },
    )?;

    let patient = load_patient(tx, appointment.patient_id)?;
    adjust_patient(tx, &patient, -1, None)?;
    refresh_doctor(tx, appointment.doctor_id, None)?;

    if let Some(payment) = tx.find_payment_by_appointment(appointment.id)? {
        if payment.state == PaymentState::Pending {
            tx.update_payment(
                payment.id,
                payment.version,
                &PaymentChanges {
                    state: Some(PaymentState::Cancelled),
                    ..PaymentChanges::default()
                },
            )?;
            debug!(appointment_id = appointment.id, "Pending payment {} cancelled", payment.id);
        }
    }

    Ok(cancelled)
}

/// Moves the active-appointment counter by `delta` (never below zero) and
/// optionally stamps `last_consultation`.
fn adjust_patient(
    tx: &mut AuditedTx<'_>,
    patient: &Patient,
    delta: i64,
    consulted_at: Option<DateTime<Utc>>,
) -> Result<Patient, SchedulingError> {
    let count = (patient.appointment_count + delta).max(0);
    if count == patient.appointment_count && consulted_at.is_none() {
        return Ok(patient.clone());
    }

    Ok(tx.update_patient(
        patient.id,
        patient.version,
        &PatientChanges {
            appointment_count: Some(count),
            last_consultation: consulted_at.map(Some),
            ..PatientChanges::default()
        },
    )?)
}

/// Recomputes `next_available_slot` from the doctor's upcoming appointments.
fn refresh_doctor(
    tx: &mut AuditedTx<'_>,
    doctor_id: i64,
    consulted_at: Option<DateTime<Utc>>,
) -> Result<Doctor, SchedulingError> {
    let doctor = load_doctor(tx, doctor_id)?;
    let next_slot = tx.earliest_upcoming_slot(doctor_id)?;

    let changes = DoctorChanges {
        next_available_slot: (doctor.next_available_slot != next_slot).then_some(next_slot),
        last_consultation: consulted_at.map(Some),
        ..DoctorChanges::default()
    };
    if changes.next_available_slot.is_none() && changes.last_consultation.is_none() {
        return Ok(doctor);
    }

    Ok(tx.update_doctor(doctor_id, doctor.version, &changes)?)
}

// ==============================================================================
// VALIDATION
// ==============================================================================

fn validate_booking(request: &BookAppointmentRequest, now: DateTime<Utc>) -> Result<(), SchedulingError> {
    if request.scheduled_at <= now {
        return Err(SchedulingError::ValidationError(
            "scheduled_at must be in the future".to_string(),
        ));
    }
    // Slots are compared at the stored precision
    if request.scheduled_at.nanosecond() % 1_000 != 0 {
        return Err(SchedulingError::ValidationError(
            "scheduled_at must not be more precise than a microsecond".to_string(),
        ));
    }
    if let Some(reason) = &request.reason {
        validate_reason(reason)?;
    }
    Ok(())
}

fn validate_reason(reason: &str) -> Result<(), SchedulingError> {
    if reason.chars().count() > MAX_REASON_CHARS {
        return Err(SchedulingError::ValidationError(format!(
            "reason must be at most {} characters",
            MAX_REASON_CHARS
        )));
    }
    Ok(())
}

fn cancellation_note(reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        "Cancelled".to_string()
    } else {
        format!("Cancelled: {}", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(offset: Duration, reason: Option<String>) -> BookAppointmentRequest {
        BookAppointmentRequest {
            patient_id: 1,
            doctor_id: 1,
            scheduled_at: Utc::now() + offset,
            reason,
        }
    }

    #[test]
    fn booking_in_the_past_is_rejected() {
        let err = validate_booking(&request(Duration::hours(-1), None), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn sub_microsecond_times_are_rejected() {
        let at = (Utc::now() + Duration::days(1)).with_nanosecond(0).unwrap();
        let mut exact = request(Duration::zero(), None);
        exact.scheduled_at = at + Duration::microseconds(250);
        assert!(validate_booking(&exact, Utc::now()).is_ok());

        let mut finer = exact.clone();
        finer.scheduled_at = at + Duration::nanoseconds(100);
        let err = validate_booking(&finer, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn reason_length_is_bounded() {
        let ok = "a".repeat(MAX_REASON_CHARS);
        assert!(validate_booking(&request(Duration::days(1), Some(ok)), Utc::now()).is_ok());

        let too_long = "a".repeat(MAX_REASON_CHARS + 1);
        assert!(validate_booking(&request(Duration::days(1), Some(too_long)), Utc::now()).is_err());
    }

    #[test]
    fn cancellation_note_carries_reason() {
        assert_eq!(cancellation_note("patient travelling"), "Cancelled: patient travelling");
        assert_eq!(cancellation_note("  "), "Cancelled");
    }
}
