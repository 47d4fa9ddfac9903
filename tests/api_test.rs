//! HTTP API tests against the full router

mod common;

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use bakery::models::NodeStatus;

use common::{Harness, TEMPLATE};

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn send_raw(router: &Router, method: Method, uri: &str, body: &[u8]) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_vec()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn test_health_check() {
    let h = Harness::new().await;
    let (status, body) = send(&h.router(), Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
}

#[tokio::test]
async fn test_bake_through_oven() {
    let h = Harness::new().await;
    let router = h.router();

    let (status, _) = send(&router, Method::POST, "/api/v1/nodes/pi-01", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, Method::GET, "/api/v1/fridge", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], "pi-01");

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/oven",
        Some(json!({ "templateName": TEMPLATE, "nodeId": "pi-01" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["id"], "pi-01");

    let mut ready = false;
    for _ in 0..100 {
        if h.manager.get_node("pi-01").unwrap().status == NodeStatus::Ready {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready);

    let (status, body) = send(&router, Method::GET, "/api/v1/oven", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["status"], "ready");
    assert_eq!(body["data"][0]["template"], TEMPLATE);

    let (status, body) = send(&router, Method::DELETE, "/api/v1/oven/pi-01", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "available");
}

#[tokio::test]
async fn test_error_statuses() {
    let h = Harness::new().await;
    let router = h.router();

    let (status, body) = send(&router, Method::GET, "/api/v1/nodes/pi-42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    send(&router, Method::POST, "/api/v1/nodes/pi-01", None).await;
    let (status, _) = send(&router, Method::DELETE, "/api/v1/oven/pi-01", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/v1/oven",
        Some(json!({ "templateName": "alpine" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, Method::POST, "/api/v1/disks", Some(json!({ "size": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_root_disk_detach_is_forbidden() {
    let h = Harness::new().await;
    h.manager.register_node("pi-01").await.unwrap();
    let node = h.manager.bake("pi-01", TEMPLATE).await.unwrap();
    let router = h.router();

    let uri = format!("/api/v1/nodes/pi-01/disks/{}", node.disks[0]);
    let (status, _) = send(&router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_disks_and_files() {
    let h = Harness::new().await;
    h.manager.register_node("pi-01").await.unwrap();
    h.manager.bake("pi-01", TEMPLATE).await.unwrap();
    let router = h.router();

    let (status, body) = send(&router, Method::POST, "/api/v1/disks", Some(json!({ "size": 4 }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["sizeMib"], 4);
    let disk_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/nodes/pi-01/disks",
        Some(json!({ "diskId": disk_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["disks"].as_array().unwrap().len(), 2);

    let (status, _) = send_raw(
        &router,
        Method::PUT,
        "/api/v1/nodes/pi-01/files/ssh/authorized_keys",
        b"ssh-ed25519 AAAA",
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, content) = send_raw(
        &router,
        Method::GET,
        "/api/v1/nodes/pi-01/files/ssh/authorized_keys",
        b"",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, b"ssh-ed25519 AAAA");

    let (status, content) = send_raw(&router, Method::GET, "/api/v1/boot/pi-01/kernel8.img", b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, b"kernel");

    let (status, body) = send(&router, Method::GET, "/api/v1/exports", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["exported"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_template_upload_and_listing() {
    let h = Harness::new().await;
    let router = h.router();

    let (status, _) = send_raw(&router, Method::PUT, "/api/v1/templates/dietpi", b"raw image").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send_raw(&router, Method::PUT, "/api/v1/templates/dietpi", b"raw image").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&router, Method::GET, "/api/v1/templates", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["dietpi", TEMPLATE]);

    let (status, _) = send(&router, Method::DELETE, "/api/v1/templates/dietpi", None).await;
    assert_eq!(status, StatusCode::OK);
}
