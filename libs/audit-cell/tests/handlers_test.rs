use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use audit_cell::{audit_routes, AuditRecorder};
use shared_database::NewSpecialty;
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestStore, TestUser};

struct Harness {
    app: Router,
    recorder: AuditRecorder<shared_database::SqliteStore>,
    _store: TestStore,
}

fn harness() -> Harness {
    let store = TestStore::new();
    let (recorder, _worker) = AuditRecorder::with_retry_worker(store.store.clone(), 3, Duration::from_millis(5));
    let app = audit_routes(TestConfig::default().to_arc(), &recorder);
    Harness { app, recorder, _store: store }
}

fn get(uri: &str, user: Option<&TestUser>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", JwtTestUtils::bearer(user));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn admin_reads_a_record_trail() {
    let h = harness();
    let specialty = h
        .recorder
        .run(Some(1), |tx| {
            tx.insert_specialty(&NewSpecialty {
                name: "Cardiology".to_string(),
                description: None,
            })
        })
        .await
        .unwrap();

    let admin = TestUser::admin(1);
    let response = h
        .app
        .oneshot(get(&format!("/specialties/{}", specialty.id), Some(&admin)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["trail"][0]["action"], "insert");
    assert_eq!(body["trail"][0]["actor_user_id"], 1);
}

#[tokio::test]
async fn non_admin_is_forbidden() {
    let h = harness();
    let doctor = TestUser::doctor(2);

    let response = h.app.oneshot(get("/stats", Some(&doctor))).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let h = harness();

    let response = h.app.oneshot(get("/anomalies", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_table_is_rejected() {
    let h = harness();
    let admin = TestUser::admin(1);

    let response = h.app.oneshot(get("/recent/sessions", Some(&admin))).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn anomalies_default_to_configured_threshold() {
    let h = harness();
    let admin = TestUser::admin(1);

    let response = h.app.oneshot(get("/anomalies", Some(&admin))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["threshold"], TestConfig::default().to_app_config().anomaly_threshold);
    assert_eq!(body["anomalies"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn summary_of_unknown_appointment_is_not_found() {
    let h = harness();
    let admin = TestUser::admin(1);

    let response = h.app.oneshot(get("/appointment/999", Some(&admin))).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn date_range_requires_ordered_days() {
    let h = harness();
    let admin = TestUser::admin(1);

    let response = h
        .app
        .oneshot(get("/range/appointments?from=2030-01-05&to=2030-01-01", Some(&admin)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dead_letters_are_listed() {
    let h = harness();
    let admin = TestUser::admin(1);

    let response = h.app.oneshot(get("/dead-letters", Some(&admin))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["pending_retries"], 0);
}

#[tokio::test]
async fn validation_is_admin_only() {
    let h = harness();
    let admin = TestUser::admin(1);

    let response = h.app.clone().oneshot(get("/validate", Some(&admin))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["is_valid"], true);
    assert_eq!(body["total_records"], 0);
    assert_eq!(body["checks"].as_array().unwrap().len(), 6);

    let response = h.app.oneshot(get("/validate", Some(&TestUser::patient(3)))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
