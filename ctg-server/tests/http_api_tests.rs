//! Control-plane tests against the full router, backed by the in-memory
//! stores.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`

use ctg_core::session::{
    AnalysisUpdate, CacheStore, EventSpan, FilteredDataPoint, MemoryCache, MemoryRepository,
    SessionManager, SessionRepository,
};
use ctg_server::api::{create_router, ApiState};
use ctg_server::hub::Hub;

fn test_state() -> (Router, Arc<SessionManager>) {
    let cache = Arc::new(MemoryCache::default());
    let repository = Arc::new(MemoryRepository::default());
    let manager = Arc::new(SessionManager::new(
        cache as Arc<dyn CacheStore>,
        repository as Arc<dyn SessionRepository>,
        86_400,
    ));
    let router = create_router(ApiState {
        manager: Arc::clone(&manager),
        hub: Arc::new(Hub::new()),
    });
    (router, manager)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_session(router: &Router) -> String {
    let response = router
        .clone()
        .oneshot(post_json("/api/sessions", r#"{"created_from":"web"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    body["session"]["id"].as_str().unwrap().to_string()
}

fn seeded_update(session_id: &str) -> AnalysisUpdate {
    AnalysisUpdate {
        session_id: session_id.to_string(),
        stv: 5.2,
        ltv: 14.8,
        baseline_heart_rate: 140.0,
        data_points: 40,
        accelerations: vec![EventSpan {
            start: 10.0,
            end: 15.0,
            duration: 5.0,
            amplitude: 12.0,
            is_late: false,
        }],
        stvs: vec![5.0, 5.1, 5.2],
        stvs_window_duration: 60.0,
        filtered_bpm: vec![
            FilteredDataPoint { time_sec: 1.0, value: 120.0 },
            FilteredDataPoint { time_sec: 1.25, value: 121.0 },
        ],
        ..AnalysisUpdate::default()
    }
}

#[tokio::test]
async fn health_returns_plain_ok() {
    let (router, _) = test_state();
    let response = router.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn create_returns_created_session() {
    let (router, _) = test_state();
    let response = router
        .oneshot(post_json(
            "/api/sessions",
            r#"{"patient_id":"p-1","created_from":"web"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["session"]["status"], "ACTIVE");
    assert_eq!(body["session"]["metadata"]["patient_id"], "p-1");
    assert!(body["session"]["id"].as_str().unwrap().len() > 10);
}

#[tokio::test]
async fn get_unknown_session_is_404_with_error_body() {
    let (router, _) = test_state();
    let response = router.oneshot(get("/api/sessions/nope")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["status"], 404);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn stop_transitions_the_session_and_rejects_a_second_stop() {
    let (router, _) = test_state();
    let id = create_session(&router).await;

    let response = router
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/stop"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["session"]["status"], "STOPPED");

    let response = router
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/stop"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn metrics_is_404_until_analysis_arrives() {
    let (router, manager) = test_state();
    let id = create_session(&router).await;

    let response = router
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}/metrics")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    manager.apply_analysis(&seeded_update(&id)).await.unwrap();

    let response = router
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}/metrics")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["stv"], 5.2);
    assert_eq!(body["baseline_heart_rate"], 140.0);
}

#[tokio::test]
async fn data_returns_the_full_composite() {
    let (router, manager) = test_state();
    let id = create_session(&router).await;
    manager.apply_analysis(&seeded_update(&id)).await.unwrap();

    let response = router
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}/data")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["session"]["total_data_points"], 40);
    assert_eq!(body["events"].as_array().unwrap().len(), 1);
    assert_eq!(body["events"][0]["type"], "acceleration");
    assert_eq!(body["time_series_stv"].as_array().unwrap().len(), 3);
    assert_eq!(body["filtered_bpm_data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn save_moves_the_session_into_the_listing() {
    let (router, _) = test_state();
    let id = create_session(&router).await;

    // Nothing durable yet.
    let response = router.clone().oneshot(get("/api/sessions")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 0);

    let response = router
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/stop"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{id}/save"),
            r#"{"notes":"routine"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get("/api/sessions?limit=10&offset=0"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["limit"], 10);
    assert_eq!(body["sessions"][0]["status"], "SAVED");
    assert_eq!(body["sessions"][0]["metadata"]["notes"], "routine");
}

#[tokio::test]
async fn delete_removes_the_session_everywhere() {
    let (router, _) = test_state();
    let id = create_session(&router).await;

    let response = router
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/stop"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = router
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/save"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/api/sessions/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
