use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tempfile::TempDir;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{
    EntityStore, NewDoctor, NewPatient, NewSpecialty, NewUser, SqliteStore,
};
use shared_models::auth::Actor;
use shared_models::clinic::{Doctor, Patient, Role, Specialty};

pub struct TestConfig {
    pub jwt_secret: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
        }
    }
}

impl TestConfig {
    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            jwt_secret: self.jwt_secret.clone(),
            transient_retry_attempts: 2,
            audit_retry_attempts: 3,
            audit_retry_delay_ms: 10,
            ..AppConfig::default()
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: i64,
    pub email: String,
    pub role: Role,
}

impl TestUser {
    pub fn new(id: i64, role: Role) -> Self {
        Self {
            id,
            email: format!("{}-{}@clinic.test", role, id),
            role,
        }
    }

    pub fn doctor(id: i64) -> Self {
        Self::new(id, Role::Doctor)
    }

    pub fn patient(id: i64) -> Self {
        Self::new(id, Role::Patient)
    }

    pub fn admin(id: i64) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn to_actor(&self) -> Actor {
        Actor {
            user_id: self.id,
            email: Some(self.email.clone()),
            role: self.role,
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        Self::create_token_with_claims(
            json!({
                "sub": user.id.to_string(),
                "email": user.email,
                "role": user.role.as_str(),
                "iat": now.timestamp(),
                "exp": exp.timestamp()
            }),
            secret,
        )
    }

    pub fn create_token_with_claims(payload: Value, secret: &str) -> String {
        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }

    pub fn bearer(user: &TestUser) -> String {
        format!(
            "Bearer {}",
            Self::create_test_token(user, &TestConfig::default().jwt_secret, None)
        )
    }
}

/// Throwaway on-disk store, deleted when dropped.
pub struct TestStore {
    pub store: SqliteStore,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_busy_timeout(StdDuration::from_secs(5))
    }

    /// Store whose transactions give up waiting for the write lock after `busy_timeout`.
    pub fn with_busy_timeout(busy_timeout: StdDuration) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let store = SqliteStore::open(dir.path().join("clinic.db"), busy_timeout).expect("open test store");
        Self { store, _dir: dir }
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.store.path().to_path_buf()
    }

    /// Opens a side connection, e.g. to simulate an outage with a trigger.
    pub fn raw_connection(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.path()).expect("open side connection")
    }

    pub async fn specialty(&self, name: &str) -> Specialty {
        let name = name.to_string();
        self.store
            .transaction(move |tx| {
                tx.insert_specialty(&NewSpecialty {
                    name,
                    description: None,
                })
            })
            .await
            .expect("seed specialty")
    }

    pub async fn doctor(&self, specialty_id: i64) -> Doctor {
        let tag = Uuid::new_v4().simple().to_string();
        self.store
            .transaction(move |tx| {
                let user = tx.insert_user(&NewUser {
                    email: format!("doctor-{}@clinic.test", tag),
                    first_name: "Test".into(),
                    last_name: "Doctor".into(),
                    national_id: None,
                    role: Role::Doctor,
                })?;
                tx.insert_doctor(&NewDoctor {
                    user_id: user.id,
                    specialty_id,
                    license_number: format!("LIC-{}", tag),
                    consult_fee: 150.0,
                    phone: None,
                    availability: None,
                })
            })
            .await
            .expect("seed doctor")
    }

    pub async fn patient(&self) -> Patient {
        let tag = Uuid::new_v4().simple().to_string();
        self.store
            .transaction(move |tx| {
                let user = tx.insert_user(&NewUser {
                    email: format!("patient-{}@clinic.test", tag),
                    first_name: "Test".into(),
                    last_name: "Patient".into(),
                    national_id: None,
                    role: Role::Patient,
                })?;
                tx.insert_patient(&NewPatient {
                    user_id: user.id,
                    phone: None,
                    birth_date: NaiveDate::from_ymd_opt(1985, 6, 15).unwrap_or_default(),
                    blood_type: None,
                    allergies: None,
                    chronic_conditions: None,
                    medications: None,
                    emergency_contact: None,
                })
            })
            .await
            .expect("seed patient")
    }

    pub async fn find_patient(&self, id: i64) -> Patient {
        self.store
            .read(move |tx| tx.find_patient(id))
            .await
            .expect("read patient")
            .expect("patient exists")
    }

    pub async fn find_doctor(&self, id: i64) -> Doctor {
        self.store
            .read(move |tx| tx.find_doctor(id))
            .await
            .expect("read doctor")
            .expect("doctor exists")
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Seeds one specialty, `doctors` doctors and `patients` patients.
pub async fn seed_clinic(store: &TestStore, doctors: usize, patients: usize) -> (Vec<Doctor>, Vec<Patient>) {
    let specialty = store.specialty(&format!("General-{}", Uuid::new_v4().simple())).await;
    let mut seeded_doctors = Vec::with_capacity(doctors);
    for _ in 0..doctors {
        seeded_doctors.push(store.doctor(specialty.id).await);
    }
    let mut seeded_patients = Vec::with_capacity(patients);
    for _ in 0..patients {
        seeded_patients.push(store.patient().await);
    }
    (seeded_doctors, seeded_patients)
}
