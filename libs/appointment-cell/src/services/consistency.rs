// libs/appointment-cell/src/services/consistency.rs
//
// Read-only audit of the scheduling invariants: one active appointment per
// slot, patient counters, and doctor next-slot bookkeeping.
//

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use shared_database::{AppointmentFilter, EntityStore};
use shared_models::clinic::{Appointment, Doctor, Patient};

use crate::models::{ConsistencyReport, CountMismatch, SchedulingError, SlotMismatch};
use crate::services::conflict::find_double_bookings;

#[derive(Clone)]
pub struct ConsistencyChecker<S: EntityStore> {
    store: S,
}

impl<S: EntityStore> ConsistencyChecker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<ConsistencyReport, SchedulingError> {
        let (appointments, patients, doctors) = self
            .store
            .read(|tx| {
                Ok::<_, SchedulingError>((
                    tx.list_appointments(&AppointmentFilter::default())?,
                    tx.list_patients()?,
                    tx.list_doctors(None)?,
                ))
            })
            .await?;

        let report = evaluate(&appointments, &patients, &doctors, Utc::now());
        if report.is_consistent {
            info!("Scheduling data consistent ({} appointments)", appointments.len());
        } else {
            warn!(
                double_bookings = report.double_bookings.len(),
                count_mismatches = report.count_mismatches.len(),
                slot_mismatches = report.slot_mismatches.len(),
                "Scheduling inconsistencies found"
            );
        }
        Ok(report)
    }
}

pub fn evaluate(
    appointments: &[Appointment],
    patients: &[Patient],
    doctors: &[Doctor],
    checked_at: DateTime<Utc>,
) -> ConsistencyReport {
    let double_bookings = find_double_bookings(appointments);

    let mut active_per_patient: HashMap<i64, i64> = HashMap::new();
    let mut next_slot_per_doctor: HashMap<i64, DateTime<Utc>> = HashMap::new();
    for appointment in appointments {
        if appointment.state.holds_slot() {
            *active_per_patient.entry(appointment.patient_id).or_insert(0) += 1;
        }
        if appointment.state.is_upcoming() {
            next_slot_per_doctor
                .entry(appointment.doctor_id)
                .and_modify(|slot| *slot = (*slot).min(appointment.scheduled_at))
                .or_insert(appointment.scheduled_at);
        }
    }

    let count_mismatches: Vec<CountMismatch> = patients
        .iter()
        .filter_map(|patient| {
            let actual = active_per_patient.get(&patient.id).copied().unwrap_or(0);
            (patient.appointment_count != actual).then_some(CountMismatch {
                patient_id: patient.id,
                recorded: patient.appointment_count,
                actual,
            })
        })
        .collect();

    let slot_mismatches: Vec<SlotMismatch> = doctors
        .iter()
        .filter_map(|doctor| {
            let expected = next_slot_per_doctor.get(&doctor.id).copied();
            (doctor.next_available_slot != expected).then_some(SlotMismatch {
                doctor_id: doctor.id,
                recorded: doctor.next_available_slot,
                expected,
            })
        })
        .collect();

    ConsistencyReport {
        checked_at,
        is_consistent: double_bookings.is_empty() && count_mismatches.is_empty() && slot_mismatches.is_empty(),
        double_bookings,
        count_mismatches,
        slot_mismatches,
    }
}
