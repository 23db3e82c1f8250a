//! HTTP surface tests driven through the router without a listener.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use pretty_assertions::assert_eq;
use proctorwatch_lib::{
    api,
    db::Database,
    evidence::FileVideoArchive,
    settings::{EngineSettings, SettingsStore},
    signal::PassthroughDetector,
    AppState, SharedState,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app() -> (Router, SharedState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::new(dir.path().join("api.sqlite3")).unwrap();
    let archive = FileVideoArchive::new(dir.path()).unwrap();
    let settings = EngineSettings {
        interval_duration_secs: 60,
        rollover_tick_ms: 0,
        storage_retry_base_ms: 1,
        ..EngineSettings::default()
    };
    let state = AppState::new(
        Arc::new(database),
        Arc::new(archive),
        Arc::new(PassthroughDetector),
        Arc::new(SettingsStore::in_memory(settings)),
    );
    (api::router(Arc::clone(&state)), state, dir)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_active_sessions() {
    let (app, _state, _dir) = test_app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn frame_submissions_score_and_end_flags_the_window() {
    let (app, _state, _dir) = test_app();

    let (status, created) = call(
        &app,
        "POST",
        "/session/create",
        Some(json!({ "user_id": "student-1", "exam_id": "algebra" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["success"], true);
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let frame = json!({
        "frame": "data:image/jpeg;base64,AAAA",
        "screenActivity": { "tabSwitches": 2 },
        "gaze": { "status": "distracted" },
        "faces": { "count": 1 }
    });
    let (status, receipt) =
        call(&app, "POST", &format!("/session/{session_id}/frame"), Some(frame)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["interval_score"], 10);
    assert_eq!(receipt["status"], "flagged");

    let (status, stats) = call(&app, "GET", "/sessions/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["active_sessions"], 1);

    let (status, ended) = call(
        &app,
        "POST",
        "/session/end",
        Some(json!({ "session_id": session_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["already_ended"], false);
    assert_eq!(ended["report"]["total_score"], 10);
    assert_eq!(ended["report"]["overall_status"], "FLAGGED");

    let (status, details) =
        call(&app, "GET", &format!("/session/{session_id}/details"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["session"]["status"], "ended");
    assert_eq!(details["flagged_intervals"].as_array().unwrap().len(), 1);
    assert_eq!(details["statistics"]["max_score"], 10);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/session/{session_id}/frame"),
        Some(json!({ "frame": "AAAA" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "session_ended");
}

#[tokio::test]
async fn missing_user_id_is_a_bad_request() {
    let (app, _state, _dir) = test_app();
    let (status, body) = call(&app, "POST", "/session/create", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn frame_without_data_is_a_bad_request() {
    let (app, _state, _dir) = test_app();
    let (_, created) = call(
        &app,
        "POST",
        "/session/create",
        Some(json!({ "user_id": "student-2" })),
    )
    .await;
    let session_id = created["session_id"].as_str().unwrap();

    let (status, _) = call(
        &app,
        "POST",
        &format!("/session/{session_id}/frame"),
        Some(json!({ "gaze": { "status": "focused" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let (app, _state, _dir) = test_app();

    let (status, body) = call(&app, "GET", "/session/nope/details", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = call(
        &app,
        "POST",
        "/session/end",
        Some(json!({ "session_id": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn video_paths_outside_the_archive_are_forbidden() {
    let (app, _state, _dir) = test_app();
    let (status, body) = call(
        &app,
        "POST",
        "/video/path",
        Some(json!({ "video_path": "../../../../etc/passwd" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");

    let (status, _) = call(&app, "GET", "/video/missing%2Fclip.json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn flagged_listing_rejects_inverted_score_bounds() {
    let (app, _state, _dir) = test_app();
    let (status, _) = call(&app, "GET", "/flagged/all?min_score=20&max_score=5", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "GET", "/flagged/all?violation_type=tab_switch", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn settings_updates_are_validated() {
    let (app, state, _dir) = test_app();

    let (status, current) = call(&app, "GET", "/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["flag_threshold"], 10);

    let mut invalid = current.clone();
    invalid["interval_duration_secs"] = json!(0);
    let (status, _) = call(&app, "PUT", "/settings", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut updated = current;
    updated["flag_threshold"] = json!(15);
    let (status, _) = call(&app, "PUT", "/settings", Some(updated)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.settings.engine().flag_threshold, 15);
}

#[tokio::test]
async fn out_of_range_frames_are_bad_requests() {
    let (app, _state, _dir) = test_app();
    let (_, created) = call(
        &app,
        "POST",
        "/session/create",
        Some(json!({ "user_id": "student-3" })),
    )
    .await;
    let session_id = created["session_id"].as_str().unwrap();

    let (status, body) = call(
        &app,
        "POST",
        &format!("/session/{session_id}/frame"),
        Some(json!({ "frame": "AAAA", "screenActivity": { "tabSwitches": 4294967295u32 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/session/{session_id}/signal"),
        Some(json!({ "timestamp": "9999-12-31T23:59:59Z", "screen": { "tab_switches": 1 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, details) = call(&app, "GET", &format!("/session/{session_id}/details"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["session"]["total_score"], 0);
    assert_eq!(details["monitoring_data"]["interval_score"], 0);
}
