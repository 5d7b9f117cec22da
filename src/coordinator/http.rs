//! HTTP API for the coordinator
//!
//! Admin endpoints manage collections, replicas and cluster properties. The
//! document endpoints route updates to shard leaders and fan queries out to
//! Active replicas. Failures are reported as
//! `{"status": "error", "kind": ..., "error": ...}` with the status code of the
//! underlying [`Error`].

use crate::common::{Error, ReplicaRole, METRICS};
use crate::coordinator::admin::{CollectionAdmin, CreateCollectionRequest};
use crate::coordinator::router::UpdateRouter;
use crate::coordinator::state::ClusterStateStore;
use crate::replica::engine::{QueryExpr, UpdateOp};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct CoordState {
    pub store: ClusterStateStore,
    pub admin: Arc<CollectionAdmin>,
    pub router: Arc<UpdateRouter>,
}

/// Error response carrying the error kind and matching status code.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(json!({
                "status": "error",
                "kind": self.0.kind(),
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Collection admin
        .route(
            "/admin/collections",
            post(create_collection).get(list_collections),
        )
        .route(
            "/admin/collections/:name",
            get(collection_status).delete(delete_collection),
        )
        .route(
            "/admin/collections/:name/shards/:shard/replicas",
            post(add_replica),
        )
        .route(
            "/admin/collections/:name/shards/:shard/replicas/:replica",
            delete(delete_replica),
        )
        .route("/admin/cluster/properties/:key", put(set_cluster_property))
        // Documents
        .route("/collections/:name/update", post(update))
        .route("/collections/:name/commit", post(commit))
        .route("/collections/:name/select", get(select))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    let cluster = state.store.current();
    let status = if cluster.stale { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "live_nodes": cluster.live_nodes.iter().collect::<Vec<_>>(),
        "collections": cluster.collections.len(),
        "revision": cluster.revision,
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

async fn create_collection(
    State(state): State<CoordState>,
    Json(req): Json<CreateCollectionRequest>,
) -> ApiResult<impl IntoResponse> {
    let coll = state.admin.create_collection(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "ok", "collection": coll })),
    ))
}

async fn list_collections(State(state): State<CoordState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "collections": state.admin.list_collections(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    #[serde(default)]
    cores: bool,
}

async fn collection_status(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Query(params): Query<StatusParams>,
) -> ApiResult<Json<Value>> {
    let status = state.admin.collection_status(&name, params.cores).await?;
    Ok(Json(json!({ "status": "ok", "collection": status })))
}

async fn delete_collection(
    State(state): State<CoordState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.admin.delete_collection(&name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct AddReplicaRequest {
    role: ReplicaRole,
}

async fn add_replica(
    State(state): State<CoordState>,
    Path((name, shard)): Path<(String, String)>,
    Json(req): Json<AddReplicaRequest>,
) -> ApiResult<impl IntoResponse> {
    let replica = state.admin.add_replica(&name, &shard, req.role).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "ok", "replica": replica })),
    ))
}

async fn delete_replica(
    State(state): State<CoordState>,
    Path((name, shard, replica)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    state.admin.delete_replica(&name, &shard, &replica).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct PropertyRequest {
    value: Option<String>,
}

async fn set_cluster_property(
    State(state): State<CoordState>,
    Path(key): Path<String>,
    Json(req): Json<PropertyRequest>,
) -> ApiResult<Json<Value>> {
    state.admin.set_cluster_property(&key, req.value)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn update(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Json(op): Json<UpdateOp>,
) -> ApiResult<Json<Value>> {
    let receipt = state.router.write(&name, op).await?;
    Ok(Json(json!({
        "status": "ok",
        "shard": receipt.shard,
        "leader": receipt.leader,
        "sequence": receipt.sequence,
    })))
}

async fn commit(
    State(state): State<CoordState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let generations = state.router.commit(&name).await?;
    let shards: serde_json::Map<String, Value> = generations
        .into_iter()
        .map(|(shard, generation)| (shard, json!(generation)))
        .collect();
    Ok(Json(json!({ "status": "ok", "shards": shards })))
}

#[derive(Debug, Deserialize)]
struct SelectParams {
    #[serde(default = "default_query")]
    q: String,
}

fn default_query() -> String {
    "*:*".to_string()
}

async fn select(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Query(params): Query<SelectParams>,
) -> ApiResult<Json<Value>> {
    let query = QueryExpr::parse(&params.q)?;
    let response = state.router.query(&name, &query).await?;
    Ok(Json(json!({
        "status": "ok",
        "num_found": response.num_found,
        "docs": response.docs,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body() {
        let response = ApiError(Error::NoLeader {
            collection: "c".into(),
            shard: "shard1".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError(Error::UnknownClusterProperty("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
