use std::time::Duration as StdDuration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use appointment_cell::appointment_routes;
use audit_cell::AuditRecorder;
use shared_models::clinic::{Doctor, Patient};
use shared_utils::test_utils::{seed_clinic, JwtTestUtils, TestConfig, TestStore, TestUser};

struct Harness {
    app: Router,
    doctors: Vec<Doctor>,
    patients: Vec<Patient>,
    _store: TestStore,
}

async fn harness() -> Harness {
    let store = TestStore::new();
    let (recorder, _worker) =
        AuditRecorder::with_retry_worker(store.store.clone(), 3, StdDuration::from_millis(5));
    let app = appointment_routes(TestConfig::default().to_arc(), &recorder);
    let (doctors, patients) = seed_clinic(&store, 2, 2).await;
    Harness {
        app,
        doctors,
        patients,
        _store: store,
    }
}

fn slot(days_ahead: i64) -> DateTime<Utc> {
    (Utc::now() + Duration::days(days_ahead))
        .duration_trunc(Duration::hours(1))
        .unwrap()
}

fn request(method: &str, uri: &str, user: Option<&TestUser>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", JwtTestUtils::bearer(user));
    }
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

fn booking_body(patient: &Patient, doctor: &Doctor, at: DateTime<Utc>) -> Value {
    json!({
        "patient_id": patient.id,
        "doctor_id": doctor.id,
        "scheduled_at": at,
        "reason": "Follow-up"
    })
}

async fn book_as_admin(h: &Harness, patient: &Patient, doctor: &Doctor, at: DateTime<Utc>) -> Value {
    let admin = TestUser::admin(1);
    let response = h
        .app
        .clone()
        .oneshot(request("POST", "/", Some(&admin), Some(booking_body(patient, doctor, at))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

#[tokio::test]
async fn patient_books_for_themselves() {
    let h = harness().await;
    let patient = &h.patients[0];
    let user = TestUser::patient(patient.user_id);

    let response = h
        .app
        .clone()
        .oneshot(request("POST", "/", Some(&user), Some(booking_body(patient, &h.doctors[0], slot(2)))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["state"], "pending");
    assert_eq!(body["patient_id"], patient.id);
}

#[tokio::test]
async fn patient_cannot_book_for_someone_else() {
    let h = harness().await;
    let user = TestUser::patient(h.patients[0].user_id);

    let response = h
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/",
            Some(&user),
            Some(booking_body(&h.patients[1], &h.doctors[0], slot(2))),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn taken_slot_is_a_conflict() {
    let h = harness().await;
    let at = slot(3);
    book_as_admin(&h, &h.patients[0], &h.doctors[0], at).await;

    let admin = TestUser::admin(1);
    let response = h
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/",
            Some(&admin),
            Some(booking_body(&h.patients[1], &h.doctors[0], at)),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "slot_unavailable");
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let h = harness().await;

    let response = h.app.clone().oneshot(request("GET", "/consistency", None, None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn participant_cancels_with_reason() {
    let h = harness().await;
    let appointment = book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let user = TestUser::patient(h.patients[0].user_id);

    let uri = format!("/{}?reason=travelling", appointment["id"]);
    let response = h.app.clone().oneshot(request("DELETE", &uri, Some(&user), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["state"], "cancelled");
    assert_eq!(body["notes"], "Cancelled: travelling");

    let again = h.app.clone().oneshot(request("DELETE", &uri, Some(&user), None)).await.unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(again).await["error"], "already_cancelled");
}

#[tokio::test]
async fn outsider_cannot_read_an_appointment() {
    let h = harness().await;
    let appointment = book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let other_doctor = TestUser::doctor(h.doctors[1].user_id);

    let uri = format!("/{}", appointment["id"]);
    let response = h.app.clone().oneshot(request("GET", &uri, Some(&other_doctor), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let own_doctor = TestUser::doctor(h.doctors[0].user_id);
    let response = h.app.clone().oneshot(request("GET", &uri, Some(&own_doctor), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn only_admins_confirm() {
    let h = harness().await;
    let appointment = book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let uri = format!("/{}/confirm", appointment["id"]);

    let patient = TestUser::patient(h.patients[0].user_id);
    let response = h.app.clone().oneshot(request("PATCH", &uri, Some(&patient), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = TestUser::admin(1);
    let response = h.app.clone().oneshot(request("PATCH", &uri, Some(&admin), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["state"], "confirmed");
}

#[tokio::test]
async fn assigned_doctor_completes_once() {
    let h = harness().await;
    let appointment = book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let admin = TestUser::admin(1);
    let doctor = TestUser::doctor(h.doctors[0].user_id);

    let confirm = format!("/{}/confirm", appointment["id"]);
    h.app.clone().oneshot(request("PATCH", &confirm, Some(&admin), None)).await.unwrap();

    let complete = format!("/{}/complete", appointment["id"]);
    let response = h.app.clone().oneshot(request("PATCH", &complete, Some(&doctor), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h.app.clone().oneshot(request("PATCH", &complete, Some(&doctor), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error"], "invalid_transition");
}

#[tokio::test]
async fn patients_list_only_their_own_appointments() {
    let h = harness().await;
    book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let user = TestUser::patient(h.patients[0].user_id);

    let response = h.app.clone().oneshot(request("GET", "/", Some(&user), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let uri = format!("/?patient_id={}", h.patients[1].id);
    let response = h.app.clone().oneshot(request("GET", &uri, Some(&user), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let uri = format!("/?patient_id={}", h.patients[0].id);
    let response = h.app.clone().oneshot(request("GET", &uri, Some(&user), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["total"], 1);
}

#[tokio::test]
async fn attachment_round_trip_over_http() {
    let h = harness().await;
    let appointment = book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let doctor = TestUser::doctor(h.doctors[0].user_id);

    let uri = format!("/{}/attachments", appointment["id"]);
    let response = h
        .app
        .clone()
        .oneshot(request(
            "POST",
            &uri,
            Some(&doctor),
            Some(json!({"kind": "prescription", "url": "https://files.clinic.test/rx.pdf", "name": "rx.pdf"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let attachment = body_json(response).await;

    let delete = format!("/attachments/{}", attachment["id"]);
    let response = h.app.clone().oneshot(request("DELETE", &delete, Some(&doctor), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h.app.clone().oneshot(request("GET", &uri, Some(&doctor), None)).await.unwrap();
    assert_eq!(body_json(response).await["total"], 0);
}

#[tokio::test]
async fn admin_runs_consistency_check() {
    let h = harness().await;
    book_as_admin(&h, &h.patients[0], &h.doctors[0], slot(2)).await;
    let admin = TestUser::admin(1);

    let response = h.app.clone().oneshot(request("GET", "/consistency", Some(&admin), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["is_consistent"], true);
}
