// libs/appointment-cell/src/services/conflict.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use shared_database::StoreTransaction;
use shared_models::clinic::Appointment;

use crate::models::{DoubleBooking, SchedulingError};

/// In-transaction check that `doctor_id` does not already hold `scheduled_at`.
///
/// This is the early exit. The partial unique index on active slots is what
/// actually stops two concurrent bookings.
pub fn ensure_slot_free(
    tx: &dyn StoreTransaction,
    doctor_id: i64,
    scheduled_at: DateTime<Utc>,
    exclude_id: Option<i64>,
) -> Result<(), SchedulingError> {
    debug!("Checking slot for doctor {} at {}", doctor_id, scheduled_at);

    if let Some(existing) = tx.find_conflicting(doctor_id, scheduled_at, exclude_id)? {
        warn!(
            "Doctor {} already holds {} with appointment {} ({})",
            doctor_id, scheduled_at, existing.id, existing.state
        );
        return Err(SchedulingError::SlotUnavailable(format!(
            "doctor {} already has appointment {} at {}",
            doctor_id, existing.id, scheduled_at
        )));
    }

    Ok(())
}

/// Slots held by more than one non-cancelled appointment.
pub fn find_double_bookings(appointments: &[Appointment]) -> Vec<DoubleBooking> {
    let mut slots: BTreeMap<(i64, DateTime<Utc>), Vec<i64>> = BTreeMap::new();
    for appointment in appointments.iter().filter(|a| a.state.holds_slot()) {
        slots
            .entry((appointment.doctor_id, appointment.scheduled_at))
            .or_default()
            .push(appointment.id);
    }

    slots
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|((doctor_id, scheduled_at), appointment_ids)| DoubleBooking {
            doctor_id,
            scheduled_at,
            appointment_ids,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared_models::clinic::AppointmentState;

    fn appointment(id: i64, doctor_id: i64, hour: u32, state: AppointmentState) -> Appointment {
        let at = Utc.with_ymd_and_hms(2031, 3, 1, hour, 0, 0).unwrap();
        Appointment {
            id,
            patient_id: 1,
            doctor_id,
            scheduled_at: at,
            reason: None,
            state,
            notes: None,
            cancelled_at: None,
            expires_at: None,
            version: 1,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn cancelled_appointments_do_not_hold_slots() {
        let appointments = vec![
            appointment(1, 1, 9, AppointmentState::Cancelled),
            appointment(2, 1, 9, AppointmentState::Pending),
            appointment(3, 2, 9, AppointmentState::Pending),
        ];
        assert!(find_double_bookings(&appointments).is_empty());
    }

    #[test]
    fn completed_appointments_still_hold_slots() {
        let appointments = vec![
            appointment(1, 1, 9, AppointmentState::Completed),
            appointment(2, 1, 9, AppointmentState::Confirmed),
            appointment(3, 1, 10, AppointmentState::Pending),
        ];
        let found = find_double_bookings(&appointments);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].appointment_ids, vec![1, 2]);
    }
}
