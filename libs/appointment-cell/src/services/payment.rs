// libs/appointment-cell/src/services/payment.rs
use tracing::{debug, info, instrument, warn};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::{EntityStore, NewPayment, PaymentChanges};
use shared_models::auth::Actor;
use shared_models::clinic::{AppointmentState, Payment};

use crate::models::{CreatePaymentRequest, PaymentStatusReport, SchedulingError};
use crate::services::lifecycle::validate_payment_transition;
use crate::services::retry::{run_with_retry, RetryPolicy};

/// Persists payment state reported by the gateway. Never calls the gateway.
#[derive(Clone)]
pub struct PaymentService<S: EntityStore> {
    recorder: AuditRecorder<S>,
    retry: RetryPolicy,
}

impl<S: EntityStore> PaymentService<S> {
    pub fn new(recorder: AuditRecorder<S>, config: &AppConfig) -> Self {
        Self {
            recorder,
            retry: RetryPolicy::from_config(config),
        }
    }

    #[instrument(skip(self, actor, request))]
    pub async fn create_payment(
        &self,
        actor: &Actor,
        appointment_id: i64,
        request: CreatePaymentRequest,
    ) -> Result<Payment, SchedulingError> {
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(SchedulingError::ValidationError("amount must be greater than zero".to_string()));
        }
        let method = request.method.trim().to_string();
        if method.is_empty() {
            return Err(SchedulingError::ValidationError("payment method is required".to_string()));
        }

        let payment = run_with_retry(&self.recorder, self.retry, "create_payment", Some(actor.user_id), move |tx| {
            let appointment = tx
                .find_appointment(appointment_id)?
                .ok_or_else(|| SchedulingError::not_found("appointment", appointment_id))?;
            if appointment.state == AppointmentState::Cancelled {
                return Err(SchedulingError::InvalidTransition(format!(
                    "appointment {} is cancelled and cannot be paid",
                    appointment_id
                )));
            }
            if tx.find_payment_by_appointment(appointment_id)?.is_some() {
                return Err(SchedulingError::ValidationError(format!(
                    "appointment {} already has a payment",
                    appointment_id
                )));
            }

            Ok(tx.insert_payment(&NewPayment {
                appointment_id,
                amount: request.amount,
                method,
            })?)
        })
        .await?;

        info!(appointment_id, payment_id = payment.id, "Payment created");
        Ok(payment)
    }

    /// Applies a gateway status report to the appointment's payment.
    #[instrument(skip(self, actor, report), fields(state = %report.state))]
    pub async fn report_status(
        &self,
        actor: &Actor,
        appointment_id: i64,
        report: PaymentStatusReport,
    ) -> Result<Payment, SchedulingError> {
        let payment = run_with_retry(&self.recorder, self.retry, "report_payment_status", Some(actor.user_id), move |tx| {
            let payment = tx
                .find_payment_by_appointment(appointment_id)?
                .ok_or_else(|| SchedulingError::not_found("payment for appointment", appointment_id))?;

            if let Err(e) = validate_payment_transition(payment.state, report.state) {
                warn!(payment_id = payment.id, "Rejected gateway report: {}", e);
                return Err(e);
            }

            Ok(tx.update_payment(
                payment.id,
                payment.version,
                &PaymentChanges {
                    state: Some(report.state),
                    gateway_reference: report.gateway_reference.map(Some),
                },
            )?)
        })
        .await?;

        info!(appointment_id, payment_id = payment.id, "Payment is now {}", payment.state);
        Ok(payment)
    }

    pub async fn get_payment(&self, appointment_id: i64) -> Result<Payment, SchedulingError> {
        debug!("Fetching payment for appointment {}", appointment_id);
        self.recorder
            .store()
            .read(move |tx| {
                tx.find_payment_by_appointment(appointment_id)?
                    .ok_or_else(|| SchedulingError::not_found("payment for appointment", appointment_id))
            })
            .await
    }
}
