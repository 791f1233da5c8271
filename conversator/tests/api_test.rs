//! REST surface tests over an in-process core.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use conversator::api::{self, ApiState};
use conversator::app_state::AppState;
use conversator::conversation::ConversationLog;
use shared_types::TaskStatus;

use support::*;

async fn api_router(core: &TestCore) -> axum::Router {
    let app_state = AppState::new(
        core.store.clone(),
        core.orchestrator.clone(),
        core.notifier.clone(),
        core.registry.clone(),
        std::sync::Arc::new(ConversationLog::new(64)),
        16,
    );
    api::router().with_state(ApiState { app: app_state })
}

async fn request(router: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_endpoint_reports_service() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (status, body) = request(&router, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    core.shutdown().await;
}

#[tokio::test]
async fn create_and_list_tasks_over_rest() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (status, body) = request(
        &router,
        "POST",
        "/api/tasks",
        Some(json!({"title": "JWT refresh fix", "priority": "high"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["task"]["task_id"].as_str().unwrap().to_string();
    assert_eq!(body["task"]["status"], "draft");

    let (status, body) = request(&router, "GET", "/api/tasks?status=draft", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["tasks"][0]["task_id"], task_id.as_str());

    let (status, body) = request(&router, "GET", &format!("/api/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"][0]["type"], "TaskCreated");

    core.shutdown().await;
}

#[tokio::test]
async fn refine_and_freeze_over_rest() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (_, body) =
        request(&router, "POST", "/api/tasks", Some(json!({"title": "x"}))).await;
    let task_id = body["task"]["task_id"].as_str().unwrap().to_string();

    let (status, _) = request(
        &router,
        "POST",
        &format!("/api/tasks/{task_id}/prompt"),
        Some(json!({"delta_summary": "initial", "intent": "do the thing"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        request(&router, "POST", &format!("/api/tasks/{task_id}/freeze"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["handoff_md_path"].as_str().unwrap().ends_with("handoff.md"));

    assert_eq!(get_task(&core, &task_id).await.status, TaskStatus::ReadyToHandoff);

    core.shutdown().await;
}

#[tokio::test]
async fn unknown_task_is_404_and_bad_transition_is_409() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (status, _) = request(&router, "GET", "/api/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = request(&router, "POST", "/api/tasks", Some(json!({"title": "x"}))).await;
    let task_id = body["task"]["task_id"].as_str().unwrap().to_string();

    // Freeze straight out of draft is an invalid transition.
    let (status, _) =
        request(&router, "POST", &format!("/api/tasks/{task_id}/freeze"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    core.shutdown().await;
}

#[tokio::test]
async fn inbox_acknowledge_round_trip() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (_, body) = request(&router, "POST", "/api/tasks", Some(json!({"title": "x"}))).await;
    let task_id = body["task"]["task_id"].as_str().unwrap().to_string();
    request(
        &router,
        "POST",
        &format!("/api/tasks/{task_id}/prompt"),
        Some(json!({"delta_summary": "d", "intent": "goal"})),
    )
    .await;
    let (status, _) = request(
        &router,
        "POST",
        &format!("/api/tasks/{task_id}/cancel"),
        Some(json!({"reason": "nvm"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_status(&core, &task_id, TaskStatus::Canceled).await;

    let (status, body) = request(&router, "GET", "/api/inbox?unread_only=true", None).await;
    assert_eq!(status, StatusCode::OK);
    let unread = body["unread_count"].as_u64().unwrap();
    assert!(unread >= 1, "cancellation must notify: {body}");

    let (status, body) = request(&router, "POST", "/api/inbox/acknowledge", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acknowledged"].as_u64().unwrap(), unread);

    let (_, body) = request(&router, "GET", "/api/inbox/unread/count", None).await;
    assert_eq!(body["unread_count"], 0);

    core.shutdown().await;
}

#[tokio::test]
async fn quick_dispatch_classification_over_rest() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (status, body) = request(
        &router,
        "POST",
        "/api/quick-dispatch",
        Some(json!({"operation": "query", "command": "git status"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);

    let (status, body) = request(
        &router,
        "POST",
        "/api/quick-dispatch",
        Some(json!({"operation": "query", "command": "rm -rf /"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["requires_full_dispatch"], true);

    let (status, _) = request(
        &router,
        "POST",
        "/api/quick-dispatch/report",
        Some(json!({"operation": "query", "command": "git status", "success": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let types = event_types(&core).await;
    assert_eq!(
        types,
        vec![
            "QuickDispatchRequested",
            "QuickDispatchRequested",
            "QuickDispatchBlocked",
            "QuickDispatchExecuted",
        ]
    );

    core.shutdown().await;
}

#[tokio::test]
async fn get_status_summarizes_for_the_voice_layer() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    request(&router, "POST", "/api/tasks", Some(json!({"title": "active one"}))).await;

    let (status, body) = request(&router, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_count"], 1);
    assert_eq!(body["active_tasks"][0]["title"], "active one");
    assert_eq!(body["builders"][0]["name"], "default");
    assert_eq!(body["builders"][0]["healthy"], true);

    core.shutdown().await;
}

#[tokio::test]
async fn conversation_feed_round_trip() {
    let core = boot_core().await;
    let router = api_router(&core).await;

    let (status, _) = request(
        &router,
        "POST",
        "/api/conversation",
        Some(json!({"speaker": "user", "text": "fix the login bug"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    request(
        &router,
        "POST",
        "/api/conversation",
        Some(json!({"speaker": "assistant", "text": "on it"})),
    )
    .await;

    let (status, body) = request(&router, "GET", "/api/conversation?after=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["entries"][0]["speaker"], "assistant");

    core.shutdown().await;
}
