// libs/appointment-cell/src/services/lifecycle.rs
use std::fmt;

use tracing::{debug, warn};

use shared_models::clinic::{AppointmentState, PaymentState};

use crate::models::SchedulingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Confirm,
    Complete,
    Cancel,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleAction::Confirm => "confirm",
            LifecycleAction::Complete => "complete",
            LifecycleAction::Cancel => "cancel",
        })
    }
}

/// Appointment state machine.
///
/// ```text
/// pending --confirm--> confirmed --complete--> completed
/// pending|confirmed --cancel--> cancelled
/// ```
///
/// `completed` and `cancelled` are terminal.
pub fn next_state(
    appointment_id: i64,
    current: AppointmentState,
    action: LifecycleAction,
) -> Result<AppointmentState, SchedulingError> {
    let next = match (current, action) {
        (AppointmentState::Pending, LifecycleAction::Confirm) => AppointmentState::Confirmed,
        (AppointmentState::Confirmed, LifecycleAction::Complete) => AppointmentState::Completed,
        (AppointmentState::Pending | AppointmentState::Confirmed, LifecycleAction::Cancel) => {
            AppointmentState::Cancelled
        }
        (AppointmentState::Cancelled, LifecycleAction::Cancel) => {
            return Err(SchedulingError::AlreadyCancelled(appointment_id));
        }
        (from, action) => {
            warn!("Rejected transition for appointment {}: {} from {}", appointment_id, action, from);
            return Err(SchedulingError::InvalidTransition(format!(
                "cannot {} appointment {} in state {}",
                action, appointment_id, from
            )));
        }
    };

    debug!("Appointment {} transition {} -> {}", appointment_id, current, next);
    Ok(next)
}

/// Actions still available from a state.
pub fn valid_actions(current: AppointmentState) -> Vec<LifecycleAction> {
    match current {
        AppointmentState::Pending => vec![LifecycleAction::Confirm, LifecycleAction::Cancel],
        AppointmentState::Confirmed => vec![LifecycleAction::Complete, LifecycleAction::Cancel],
        AppointmentState::Completed | AppointmentState::Cancelled => vec![],
    }
}

/// Rejects edits (notes, reassignment) of appointments that reached a terminal state.
pub fn ensure_editable(appointment_id: i64, current: AppointmentState, what: &str) -> Result<(), SchedulingError> {
    if current.is_terminal() {
        return Err(SchedulingError::InvalidTransition(format!(
            "cannot {} appointment {} in state {}",
            what, appointment_id, current
        )));
    }
    Ok(())
}

/// Payment states reported by the gateway move forward only.
pub fn validate_payment_transition(current: PaymentState, reported: PaymentState) -> Result<(), SchedulingError> {
    match (current, reported) {
        (PaymentState::Pending, PaymentState::Completed)
        | (PaymentState::Pending, PaymentState::Cancelled)
        | (PaymentState::Completed, PaymentState::Cancelled) => Ok(()),
        (from, to) => Err(SchedulingError::InvalidTransition(format!(
            "payment cannot move from {} to {}",
            from, to
        ))),
    }
}
