// libs/appointment-cell/src/services/attachment.rs
use tracing::{info, instrument};

use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::{EntityStore, NewAttachment};
use shared_models::auth::Actor;
use shared_models::clinic::Attachment;

use crate::models::{AttachFileRequest, SchedulingError};
use crate::services::retry::{run_with_retry, RetryPolicy};

#[derive(Clone)]
pub struct AttachmentService<S: EntityStore> {
    recorder: AuditRecorder<S>,
    retry: RetryPolicy,
}

impl<S: EntityStore> AttachmentService<S> {
    pub fn new(recorder: AuditRecorder<S>, config: &AppConfig) -> Self {
        Self {
            recorder,
            retry: RetryPolicy::from_config(config),
        }
    }

    #[instrument(skip(self, actor, request))]
    pub async fn attach_file(
        &self,
        actor: &Actor,
        appointment_id: i64,
        request: AttachFileRequest,
    ) -> Result<Attachment, SchedulingError> {
        for (field, value) in [("kind", &request.kind), ("url", &request.url), ("name", &request.name)] {
            if value.trim().is_empty() {
                return Err(SchedulingError::ValidationError(format!("{} is required", field)));
            }
        }

        let attachment = run_with_retry(&self.recorder, self.retry, "attach_file", Some(actor.user_id), move |tx| {
            if tx.find_appointment(appointment_id)?.is_none() {
                return Err(SchedulingError::not_found("appointment", appointment_id));
            }
            Ok(tx.insert_attachment(&NewAttachment {
                appointment_id,
                kind: request.kind,
                url: request.url,
                name: request.name,
            })?)
        })
        .await?;

        info!(appointment_id, attachment_id = attachment.id, "File attached");
        Ok(attachment)
    }

    pub async fn list_attachments(&self, appointment_id: i64) -> Result<Vec<Attachment>, SchedulingError> {
        self.recorder
            .store()
            .read(move |tx| {
                if tx.find_appointment(appointment_id)?.is_none() {
                    return Err(SchedulingError::not_found("appointment", appointment_id));
                }
                Ok(tx.list_attachments(appointment_id)?)
            })
            .await
    }

    pub async fn get_attachment(&self, attachment_id: i64) -> Result<Attachment, SchedulingError> {
        self.recorder
            .store()
            .read(move |tx| {
                tx.find_attachment(attachment_id)?
                    .ok_or_else(|| SchedulingError::not_found("attachment", attachment_id))
            })
            .await
    }

    #[instrument(skip(self, actor))]
    pub async fn remove_attachment(&self, actor: &Actor, attachment_id: i64) -> Result<(), SchedulingError> {
        let removed = run_with_retry(&self.recorder, self.retry, "remove_attachment", Some(actor.user_id), move |tx| {
        Ok(tx.delete_attachment(attachment_id)?)
    })
    .await?;

        if !removed {
            return Err(SchedulingError::not_found("attachment", attachment_id));
        }
        info!(attachment_id, "Attachment removed");
        Ok(())
    }
}
