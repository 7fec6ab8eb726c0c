use std::time::Duration;

use assert_matches::assert_matches;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use audit_cell::{AuditQueryService, AuditRecorder};
use patient_cell::{
    create_patient_router, PatientError, PatientService, RegisterPatientRequest,
    UpdateMedicalProfileRequest,
};
use shared_database::SqliteStore;
use shared_models::auth::Actor;
use shared_models::clinic::{AuditAction, AuditTable, BloodType, Role};
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestStore, TestUser};

struct Setup {
    service: PatientService<SqliteStore>,
    recorder: AuditRecorder<SqliteStore>,
    audit: AuditQueryService<SqliteStore>,
    store: TestStore,
}

fn setup() -> Setup {
    let store = TestStore::new();
    let (recorder, _worker) = AuditRecorder::with_retry_worker(store.store.clone(), 3, Duration::from_millis(5));
    Setup {
        service: PatientService::new(recorder.clone()),
        recorder,
        audit: AuditQueryService::new(store.store.clone()),
        store,
    }
}

fn admin() -> Actor {
    Actor::new(1, Role::Admin)
}

fn registration(email: &str) -> RegisterPatientRequest {
    RegisterPatientRequest {
        email: email.to_string(),
        first_name: "Martina".to_string(),
        last_name: "Lopez".to_string(),
        national_id: None,
        phone: Some("+5491133445566".to_string()),
        birth_date: NaiveDate::from_ymd_opt(1990, 3, 21).unwrap(),
        blood_type: Some(BloodType::OPositive),
        allergies: Some("penicillin".to_string()),
        chronic_conditions: None,
        medications: None,
        emergency_contact: None,
    }
}

// ==============================================================================
// SERVICE
// ==============================================================================

#[tokio::test]
async fn registration_starts_with_no_appointments() {
    let s = setup();

    let registered = s.service.register_patient(&admin(), registration("martina@clinic.test")).await.unwrap();

    assert_eq!(registered.user.role, Role::Patient);
    assert_eq!(registered.patient.user_id, registered.user.id);
    assert_eq!(registered.patient.appointment_count, 0);
    assert_eq!(registered.patient.last_consultation, None);

    let trail = s.audit.get_trail(AuditTable::Patients, registered.patient.id).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::Insert);
    assert_eq!(trail[0].actor_user_id, Some(1));
}

#[tokio::test]
async fn duplicate_email_and_future_birth_date_are_rejected() {
    let s = setup();
    s.service.register_patient(&admin(), registration("martina@clinic.test")).await.unwrap();

    let duplicate = s.service.register_patient(&admin(), registration("martina@clinic.test")).await;
    assert_matches!(duplicate, Err(PatientError::ValidationError(_)));

    let mut unborn = registration("baby@clinic.test");
    unborn.birth_date = Utc::now().date_naive() + chrono::Duration::days(30);
    let result = s.service.register_patient(&admin(), unborn).await;
    assert_matches!(result, Err(PatientError::ValidationError(_)));
}

#[tokio::test]
async fn medical_profile_updates_are_partial() {
    let s = setup();
    let patient = s
        .service
        .register_patient(&admin(), registration("martina@clinic.test"))
        .await
        .unwrap()
        .patient;

    let update = UpdateMedicalProfileRequest {
        allergies: Some(None),
        medications: Some(Some("levothyroxine".to_string())),
        ..UpdateMedicalProfileRequest::default()
    };
    let updated = s.service.update_medical_profile(&admin(), patient.id, update).await.unwrap();

    assert_eq!(updated.allergies, None);
    assert_eq!(updated.medications.as_deref(), Some("levothyroxine"));
    assert_eq!(updated.blood_type, Some(BloodType::OPositive));

    let changes = s.audit.get_changes(AuditTable::Patients, patient.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].changed_fields.contains(&"allergies".to_string()));
    assert!(changes[0].changed_fields.contains(&"medications".to_string()));

    let empty = s
        .service
        .update_medical_profile(&admin(), patient.id, UpdateMedicalProfileRequest::default())
        .await;
    assert_matches!(empty, Err(PatientError::ValidationError(_)));
}

#[tokio::test]
async fn federated_uid_belongs_to_one_patient() {
    let s = setup();
    let first = s.service.register_patient(&admin(), registration("a@clinic.test")).await.unwrap().patient;
    let second = s.service.register_patient(&admin(), registration("b@clinic.test")).await.unwrap().patient;

    let linked = s
        .service
        .link_federated_identity(&admin(), first.id, "google-oauth2|123".to_string())
        .await
        .unwrap();
    assert_eq!(linked.federated_uid.as_deref(), Some("google-oauth2|123"));

    // Relinking the same uid is a no-op
    let again = s
        .service
        .link_federated_identity(&admin(), first.id, "google-oauth2|123".to_string())
        .await
        .unwrap();
    assert_eq!(again.version, linked.version);

    let stolen = s
        .service
        .link_federated_identity(&admin(), second.id, "google-oauth2|123".to_string())
        .await;
    assert_matches!(stolen, Err(PatientError::ValidationError(_)));

    let missing = s.service.link_federated_identity(&admin(), 999, "uid".to_string()).await;
    assert_matches!(missing, Err(PatientError::NotFound { .. }));
}

// ==============================================================================
// HTTP
// ==============================================================================

fn request(method: &str, uri: &str, user: &TestUser, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", JwtTestUtils::bearer(user));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn patient_reads_and_edits_only_their_own_record() {
    let s = setup();
    let app = create_patient_router(TestConfig::default().to_arc(), &s.recorder);
    let mine = s.store.patient().await;
    let theirs = s.store.patient().await;
    let user = TestUser::patient(mine.user_id);

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/{}", mine.id), &user, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/{}", theirs.id), &user, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/{}/medical", mine.id),
            &user,
            Some(json!({"blood_type": "A-", "emergency_contact": "Jorge 1155550000"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["blood_type"], "A-");
    assert_eq!(body["version"], mine.version + 1);
}

#[tokio::test]
async fn only_admins_register_and_staff_list() {
    let s = setup();
    let app = create_patient_router(TestConfig::default().to_arc(), &s.recorder);
    let body = json!({
        "email": "nuevo@clinic.test",
        "first_name": "Nuevo",
        "last_name": "Paciente",
        "birth_date": "1979-11-02"
    });

    let response = app
        .clone()
        .oneshot(request("POST", "/", &TestUser::doctor(3), Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request("POST", "/", &TestUser::admin(1), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.clone().oneshot(request("GET", "/", &TestUser::doctor(3), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["total"], 1);

    let response = app.clone().oneshot(request("GET", "/", &TestUser::patient(9), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
