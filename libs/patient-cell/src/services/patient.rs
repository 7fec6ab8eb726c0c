// libs/patient-cell/src/services/patient.rs
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use audit_cell::AuditRecorder;
use shared_database::{EntityStore, NewPatient, NewUser, PatientChanges};
use shared_models::auth::Actor;
use shared_models::clinic::{Patient, Role};
use shared_utils::validation::{is_valid_email, is_valid_phone, required};

use crate::models::{PatientError, PatientRegistration, RegisterPatientRequest, UpdateMedicalProfileRequest};

#[derive(Clone)]
pub struct PatientService<S: EntityStore> {
    recorder: AuditRecorder<S>,
}

impl<S: EntityStore> PatientService<S> {
    pub fn new(recorder: AuditRecorder<S>) -> Self {
        Self { recorder }
    }

    /// Creates the patient's user identity and patient row in one transaction.
    #[instrument(skip(self, actor, request))]
    pub async fn register_patient(
        &self,
        actor: &Actor,
        request: RegisterPatientRequest,
    ) -> Result<PatientRegistration, PatientError> {
        debug!("Registering patient {}", request.email);
        let (new_user, new_patient) = validate_registration(request)?;

        let registration = self
            .recorder
            .run(Some(actor.user_id), move |tx| {
                if tx.find_user_by_email(&new_user.email)?.is_some() {
                    warn!("Rejected patient registration: email already registered");
                    return Err(PatientError::ValidationError("email already registered".to_string()));
                }

                let user = tx.insert_user(&new_user)?;
                let patient = tx.insert_patient(&NewPatient {
                    user_id: user.id,
                    ..new_patient
                })?;

                Ok(PatientRegistration { user, patient })
            })
            .await?;

        info!(
            patient_id = registration.patient.id,
            user_id = registration.user.id,
            "Patient registered"
        );
        Ok(registration)
    }

    #[instrument(skip(self, actor, update))]
    pub async fn update_medical_profile(
        &self,
        actor: &Actor,
        patient_id: i64,
        update: UpdateMedicalProfileRequest,
    ) -> Result<Patient, PatientError> {
        if update.is_empty() {
            return Err(PatientError::ValidationError("no fields to update".to_string()));
        }
        if let Some(Some(phone)) = &update.phone {
            if !is_valid_phone(phone) {
                return Err(PatientError::ValidationError(format!("invalid phone: {}", phone)));
            }
        }

        let changes = PatientChanges {
            phone: update.phone,
            blood_type: update.blood_type,
            allergies: update.allergies,
            chronic_conditions: update.chronic_conditions,
            medications: update.medications,
            emergency_contact: update.emergency_contact,
            ..PatientChanges::default()
        };

        let patient = self
            .recorder
            .run(Some(actor.user_id), move |tx| {
                let patient = tx
                    .find_patient(patient_id)?
                    .ok_or_else(|| PatientError::not_found(patient_id))?;
                Ok::<_, PatientError>(tx.update_patient(patient_id, patient.version, &changes)?)
            })
            .await?;

        info!(patient_id, "Medical profile updated");
        Ok(patient)
    }

    /// Links an external identity-provider uid. Each uid belongs to one patient.
    #[instrument(skip(self, actor, uid))]
    pub async fn link_federated_identity(
        &self,
        actor: &Actor,
        patient_id: i64,
        uid: String,
    ) -> Result<Patient, PatientError> {
        let uid = required("uid", &uid).map_err(PatientError::ValidationError)?;

        self.recorder
            .run(Some(actor.user_id), move |tx| {
                let patient = tx
                    .find_patient(patient_id)?
                    .ok_or_else(|| PatientError::not_found(patient_id))?;
                if patient.federated_uid.as_deref() == Some(uid.as_str()) {
                    return Ok(patient);
                }

                Ok(tx.update_patient(
                    patient_id,
                    patient.version,
                    &PatientChanges {
                        federated_uid: Some(Some(uid)),
                        ..PatientChanges::default()
                    },
                )?)
            })
            .await
    }

    pub async fn get_patient(&self, patient_id: i64) -> Result<Patient, PatientError> {
        self.recorder
            .store()
            .read(move |tx| {
                tx.find_patient(patient_id)?
                    .ok_or_else(|| PatientError::not_found(patient_id))
            })
            .await
    }

    pub async fn list_patients(&self) -> Result<Vec<Patient>, PatientError> {
        self.recorder.store().read(|tx| Ok(tx.list_patients()?)).await
    }
}

fn validate_registration(request: RegisterPatientRequest) -> Result<(NewUser, NewPatient), PatientError> {
    let email = request.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(PatientError::ValidationError(format!("invalid email: {}", request.email)));
    }
    if request.birth_date > Utc::now().date_naive() {
        return Err(PatientError::ValidationError("birth_date cannot be in the future".to_string()));
    }
    if let Some(phone) = &request.phone {
        if !is_valid_phone(phone) {
            return Err(PatientError::ValidationError(format!("invalid phone: {}", phone)));
        }
    }

    let user = NewUser {
        email,
        first_name: required("first_name", &request.first_name).map_err(PatientError::ValidationError)?,
        last_name: required("last_name", &request.last_name).map_err(PatientError::ValidationError)?,
        national_id: request.national_id,
        role: Role::Patient,
    };
    let patient = NewPatient {
        user_id: 0,
        phone: request.phone,
        birth_date: request.birth_date,
        blood_type: request.blood_type,
        allergies: request.allergies,
        chronic_conditions: request.chronic_conditions,
        medications: request.medications,
        emergency_contact: request.emergency_contact,
    };
    Ok((user, patient))
}
