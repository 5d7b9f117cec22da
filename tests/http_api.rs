//! HTTP API tests driven through the axum router

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use minishard::coordinator::http::{create_router, CoordState};
use minishard::coordinator::predicates::{active_replica_count, has_live_leader};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(cluster: &minishard::LocalCluster) -> Router {
    create_router(CoordState {
        store: cluster.store().clone(),
        admin: cluster.admin().clone(),
        router: cluster.router().clone(),
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_collection_lifecycle_over_http() {
    let cluster = start(2);
    let app = app(&cluster);

    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections",
        Some(json!({"name": "books", "shards": 1, "writer_count": 1, "passive_count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["collection"]["shards"][0]["replicas"].as_array().unwrap().len(), 2);

    wait(&cluster, "books", active_replica_count(1, 0, 1)).await;
    wait(&cluster, "books", has_live_leader("shard1")).await;

    let (status, body) = call(
        &app,
        "POST",
        "/collections/books/update",
        Some(json!({"op": "add", "id": "1", "fields": {"title": "Dune"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["shard"], "shard1");

    let (status, _) = call(&app, "POST", "/collections/books/commit", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/collections/books/select?q=title:Dune", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["num_found"], 1);
    assert_eq!(body["docs"][0]["id"], "1");

    let (status, body) = call(&app, "GET", "/admin/collections/books?cores=true", None).await;
    assert_eq!(status, StatusCode::OK);
    let shard = &body["collection"]["shards"][0];
    assert!(shard["leader"].is_string());
    assert_eq!(shard["replicas"].as_array().unwrap().len(), 2);

    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections/books/shards/shard1/replicas",
        Some(json!({"role": "passive"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let added = body["replica"]["name"].as_str().unwrap().to_string();
    assert_eq!(body["replica"]["role"], "passive");

    let (status, _) = call(
        &app,
        "DELETE",
        &format!("/admin/collections/books/shards/shard1/replicas/{}", added),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, "DELETE", "/admin/collections/books", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, "GET", "/admin/collections/books", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_error_kinds() {
    let cluster = start(1);
    let app = app(&cluster);

    let (status, body) = call(
        &app,
        "PUT",
        "/admin/cluster/properties/autoAddReplicas",
        Some(json!({"value": "true"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, _) = call(
        &app,
        "PUT",
        "/admin/cluster/properties/max_replicas_per_node",
        Some(json!({"value": "8"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        cluster.store().current().property("max_replicas_per_node"),
        Some("8")
    );

    let (status, body) = call(
        &app,
        "POST",
        "/collections/missing/update",
        Some(json!({"op": "delete", "id": "1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    // A collection without writers never gets a leader.
    let (status, _) = call(
        &app,
        "POST",
        "/admin/collections",
        Some(json!({"name": "mirror", "writer_count": 0, "passive_count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = call(
        &app,
        "POST",
        "/collections/mirror/update",
        Some(json!({"op": "add", "id": "1"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "no_leader");

    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections",
        Some(json!({"name": "mirror"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_exists");
}

#[tokio::test]
async fn test_health_and_metrics() {
    let cluster = start(2);
    let app = app(&cluster);

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["live_nodes"].as_array().unwrap().len(), 2);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("minishard_writes_routed_total"));
    assert!(text.contains("minishard_live_nodes"));
}
