mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use namewatch::admin::build_router;

use common::{context, person, FakeClient, ADMIN_ID};

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn command(app: &Router, sender_id: i64, chat_id: i64, is_group: bool, text: &str) -> String {
    let (status, body) = send(
        app,
        post_json(
            "/commands",
            json!({
                "sender_id": sender_id,
                "chat_id": chat_id,
                "chat_title": "Rustaceans",
                "is_group": is_group,
                "text": text,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["reply"].as_str().expect("reply").to_string()
}

#[tokio::test]
async fn health_reports_idle_scheduler() {
    let ctx = context(FakeClient::new()).await;
    let app = build_router(ctx);
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queued_notifications"], 0);
    assert!(body["last_scan_time"].is_null());
}

#[tokio::test]
async fn start_registers_group_and_loads_baseline() {
    let client = FakeClient::new();
    client.set_members(-100, vec![person(1, "Alice", None), person(2, "Bob", None)]);
    let ctx = context(client.clone()).await;
    let app = build_router(ctx.clone());

    let reply = command(&app, 7, -100, true, "/start").await;
    assert!(reply.contains("✅ Name tracking activated!"), "{reply}");
    assert!(reply.contains("Added 2 users"), "{reply}");

    let again = command(&app, 7, -100, true, "/start").await;
    assert!(again.contains("already active"), "{again}");

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["members_tracked"], 2);
    assert_eq!(body["active_groups"][0]["title"], "Rustaceans");
}

#[tokio::test]
async fn start_outside_a_group_is_refused() {
    let ctx = context(FakeClient::new()).await;
    let app = build_router(ctx.clone());
    let reply = command(&app, ADMIN_ID, ADMIN_ID, false, "/start").await;
    assert_eq!(reply, "❌ This command can only be used in groups.");
    assert!(ctx.registry.active_groups().await.expect("groups").is_empty());
}

#[tokio::test]
async fn scan_and_history_are_admin_only() {
    let client = FakeClient::new();
    let ctx = context(client.clone()).await;
    ctx.register_group(-1, "G").await.expect("register");
    client.set_members(-1, vec![person(1, "Alice", None)]);
    let app = build_router(ctx.clone());

    let refused = command(&app, 7, 7, false, "/scan").await;
    assert_eq!(refused, "⛔ Only the admin can use this command");
    assert_eq!(client.fetches_of(-1), 0);

    let reply = command(&app, ADMIN_ID, ADMIN_ID, false, "/scan").await;
    assert!(reply.contains("Manual scan completed"), "{reply}");
    assert!(reply.contains("New members: 1"), "{reply}");

    client.set_members(-1, vec![person(1, "Alicia", None)]);
    command(&app, ADMIN_ID, ADMIN_ID, false, "/scan").await;

    assert_eq!(
        command(&app, 7, 7, false, "/history 1").await,
        "⛔ Only the admin can use this command"
    );
    let history = command(&app, ADMIN_ID, ADMIN_ID, false, "/history 1").await;
    assert!(history.contains("First name: Alice → Alicia"), "{history}");

    let (status, body) = send(&app, get("/history/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changes"].as_array().expect("changes").len(), 1);
}

#[tokio::test]
async fn status_command_lists_monitored_groups() {
    let ctx = context(FakeClient::new()).await;
    ctx.register_group(-1, "Rustaceans").await.expect("register");
    let app = build_router(ctx);
    let reply = command(&app, 7, 7, false, "/status").await;
    assert!(reply.starts_with("📊 Status"), "{reply}");
    assert!(reply.contains("• Rustaceans"), "{reply}");
    assert!(reply.contains("Last scan: never"), "{reply}");
}

#[tokio::test]
async fn unknown_command_lists_the_available_ones() {
    let ctx = context(FakeClient::new()).await;
    let app = build_router(ctx);
    let reply = command(&app, 7, 7, false, "/dance").await;
    assert!(reply.starts_with("Unknown command 'dance'"), "{reply}");
}

#[tokio::test]
async fn pushed_sightings_register_then_change() {
    let ctx = context(FakeClient::new()).await;
    ctx.register_group(-1, "G").await.expect("register");
    let app = build_router(ctx.clone());

    let sighting = |first: &str| {
        json!({
            "type": "seen",
            "group_id": -1,
            "member": {"id": 5, "first_name": first, "username": "eve"}
        })
    };

    let (status, body) = send(&app, post_json("/events", sighting("Eve"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "registered");

    let (_, body) = send(&app, post_json("/events", sighting("Eve"))).await;
    assert_eq!(body["outcome"], "unchanged");

    let (_, body) = send(&app, post_json("/events", sighting("Evelyn"))).await;
    assert_eq!(body["outcome"], "changed");
    assert_eq!(body["member_id"], 5);
    assert_eq!(body["changes"].as_array().expect("changes").len(), 1);
    assert_eq!(ctx.notifier.queued().await, 1);

    let (_, body) = send(
        &app,
        post_json("/events", json!({"type": "left", "group_id": -1, "member_id": 5})),
    )
    .await;
    assert_eq!(body["outcome"], "left");
    assert_eq!(body["remaining"].as_array().expect("remaining").len(), 0);
}

#[tokio::test]
async fn sighting_in_unmonitored_group_is_ignored() {
    let ctx = context(FakeClient::new()).await;
    let app = build_router(ctx.clone());
    let (status, body) = send(
        &app,
        post_json(
            "/events",
            json!({"type": "seen", "group_id": -9, "member": {"id": 1, "first_name": "X"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "ignored");
    assert_eq!(ctx.store.members_tracked().await.expect("count"), 0);
}

#[tokio::test]
async fn malformed_event_is_a_bad_request() {
    let ctx = context(FakeClient::new()).await;
    let app = build_router(ctx);
    let (status, body) = send(&app, post_json("/events", json!({"type": "seen", "group_id": -1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("member"));
}
