// libs/doctor-cell/src/services/doctor.rs
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use audit_cell::AuditRecorder;
use shared_database::{DoctorChanges, EntityStore, NewDoctor, NewSpecialty, NewUser};
use shared_models::auth::Actor;
use shared_models::clinic::{Doctor, EntityState, Role, Specialty};
use shared_utils::validation::{is_valid_email, is_valid_phone, required};

use crate::models::{CreateSpecialtyRequest, DoctorError, DoctorRegistration, RegisterDoctorRequest};

/// Doctor and specialty registration. Every write is audited.
#[derive(Clone)]
pub struct DoctorService<S: EntityStore> {
    recorder: AuditRecorder<S>,
}

impl<S: EntityStore> DoctorService<S> {
    pub fn new(recorder: AuditRecorder<S>) -> Self {
        Self { recorder }
    }

    // ==============================================================================
    // SPECIALTIES
    // ==============================================================================

    #[instrument(skip(self, actor, request), fields(name = %request.name))]
    pub async fn create_specialty(&self, actor: &Actor, request: CreateSpecialtyRequest) -> Result<Specialty, DoctorError> {
        let name = required("name", &request.name).map_err(DoctorError::ValidationError)?;
        let description = request
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let specialty = self
            .recorder
            .run(Some(actor.user_id), move |tx| {
                Ok::<_, DoctorError>(tx.insert_specialty(&NewSpecialty { name, description })?)
            })
            .await?;

        info!(specialty_id = specialty.id, "Specialty created");
        Ok(specialty)
    }

    pub async fn list_specialties(&self) -> Result<Vec<Specialty>, DoctorError> {
        self.recorder
            .store()
            .read(|tx| Ok(tx.list_specialties()?))
            .await
    }

    // ==============================================================================
    // DOCTORS
    // ==============================================================================

    /// Creates the doctor's user identity and doctor row in one transaction.
    #[instrument(skip(self, actor, request), fields(specialty_id = request.specialty_id))]
    pub async fn register_doctor(
        &self,
        actor: &Actor,
        request: RegisterDoctorRequest,
    ) -> Result<DoctorRegistration, DoctorError> {
        debug!("Registering doctor {}", request.email);
        let new_user = validate_identity(&request)?;
        let new_doctor = validate_practice(&request)?;
        let specialty_id = request.specialty_id;

        let registration = self
            .recorder
            .run(Some(actor.user_id), move |tx| {
                if tx.find_specialty(specialty_id)?.is_none() {
                    return Err(DoctorError::not_found("specialty", specialty_id));
                }
                if tx.find_user_by_email(&new_user.email)?.is_some() {
                    warn!("Rejected doctor registration: email already registered");
                    return Err(DoctorError::ValidationError("email already registered".to_string()));
                }

                let user = tx.insert_user(&new_user)?;
                let doctor = tx.insert_doctor(&NewDoctor {
                    user_id: user.id,
                    ..new_doctor
                })?;

                Ok(DoctorRegistration { user, doctor })
            })
            .await?;

        info!(
            doctor_id = registration.doctor.id,
            user_id = registration.user.id,
            "Doctor registered"
        );
        Ok(registration)
    }

    /// Activates or deactivates a doctor. Setting the current state is a no-op.
    #[instrument(skip(self, actor))]
    pub async fn set_doctor_state(&self, actor: &Actor, doctor_id: i64, state: EntityState) -> Result<Doctor, DoctorError> {
        let doctor = self
            .recorder
            .run(Some(actor.user_id), move |tx| {
                let doctor = tx
                    .find_doctor(doctor_id)?
                    .ok_or_else(|| DoctorError::not_found("doctor", doctor_id))?;
                if doctor.state == state {
                    return Ok(doctor);
                }

                Ok::<_, DoctorError>(tx.update_doctor(
                    doctor_id,
                    doctor.version,
                    &DoctorChanges {
                        state: Some(state),
                        ..DoctorChanges::default()
                    },
                )?)
            })
            .await?;

        info!(doctor_id, "Doctor state is now {}", doctor.state);
        Ok(doctor)
    }

    /// Replaces the weekly availability descriptor; `None` clears it.
    #[instrument(skip(self, actor, availability))]
    pub async fn update_availability(
        &self,
        actor: &Actor,
        doctor_id: i64,
        availability: Option<Value>,
    ) -> Result<Doctor, DoctorError> {
        if let Some(descriptor) = &availability {
            validate_availability(descriptor)?;
        }

        self.recorder
            .run(Some(actor.user_id), move |tx| {
                let doctor = tx
                    .find_doctor(doctor_id)?
                    .ok_or_else(|| DoctorError::not_found("doctor", doctor_id))?;

                Ok(tx.update_doctor(
                    doctor_id,
                    doctor.version,
                    &DoctorChanges {
                        availability: Some(availability),
                        ..DoctorChanges::default()
                    },
                )?)
            })
            .await
    }

    pub async fn get_doctor(&self, doctor_id: i64) -> Result<Doctor, DoctorError> {
        self.recorder
            .store()
            .read(move |tx| {
                tx.find_doctor(doctor_id)?
                    .ok_or_else(|| DoctorError::not_found("doctor", doctor_id))
            })
            .await
    }

    pub async fn list_doctors(&self, specialty_id: Option<i64>) -> Result<Vec<Doctor>, DoctorError> {
        self.recorder
            .store()
            .read(move |tx| Ok(tx.list_doctors(specialty_id)?))
            .await
    }
}

// ==============================================================================
// VALIDATION
// ==============================================================================

fn validate_identity(request: &RegisterDoctorRequest) -> Result<NewUser, DoctorError> {
    let email = request.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(DoctorError::ValidationError(format!("invalid email: {}", request.email)));
    }

    Ok(NewUser {
        email,
        first_name: required("first_name", &request.first_name).map_err(DoctorError::ValidationError)?,
        last_name: required("last_name", &request.last_name).map_err(DoctorError::ValidationError)?,
        national_id: request.national_id.clone(),
        role: Role::Doctor,
    })
}

/// `user_id` is filled in once the user row exists.
fn validate_practice(request: &RegisterDoctorRequest) -> Result<NewDoctor, DoctorError> {
    if !request.consult_fee.is_finite() || request.consult_fee < 0.0 {
        return Err(DoctorError::ValidationError("consult_fee must be zero or positive".to_string()));
    }
    if let Some(phone) = &request.phone {
        if !is_valid_phone(phone) {
            return Err(DoctorError::ValidationError(format!("invalid phone: {}", phone)));
        }
    }
    if let Some(descriptor) = &request.availability {
        validate_availability(descriptor)?;
    }

    Ok(NewDoctor {
        user_id: 0,
        specialty_id: request.specialty_id,
        license_number: required("license_number", &request.license_number).map_err(DoctorError::ValidationError)?,
        consult_fee: request.consult_fee,
        phone: request.phone.clone(),
        availability: request.availability.clone(),
    })
}

fn validate_availability(descriptor: &Value) -> Result<(), DoctorError> {
    if !descriptor.is_object() {
        return Err(DoctorError::ValidationError(
            "availability must be a JSON object".to_string(),
        ));
    }
    Ok(())
}
