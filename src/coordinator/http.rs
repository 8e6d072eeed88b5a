//! HTTP API for a config replica member
//!
//! Admin commands answer `{"ok": true, ...}` on success and
//! `{"ok": false, "code": ..., "errmsg": ...}` on failure, with the HTTP
//! status derived from the error kind. `NotPrimary` answers 307 and names
//! the leader (and its URL when known) so clients can retry there.
//!
//! `/raft/*` carries replication traffic between members.

use crate::common::raft::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::common::Error;
use crate::coordinator::admin::AdminService;
use crate::coordinator::replica_set::ReplicaSet;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
    pub replica_set: Arc<ReplicaSet>,
    /// Member this process serves
    pub member_id: String,
    /// Member id -> base URL, used in leader hints
    pub member_urls: Arc<HashMap<String, String>>,
}

/// Error response carrying the error kind.
pub struct ApiError {
    error: Error,
    leader_url: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "ok": false,
            "code": self.error.code(),
            "errmsg": self.error.to_string(),
        });
        if let Some(leader) = self.error.leader_hint() {
            body["leader"] = json!(leader);
        }
        if let Some(url) = self.leader_url {
            body["leaderUrl"] = json!(url);
        }
        (self.error.to_http_status(), Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

impl AppState {
    fn fail(&self, error: Error) -> ApiError {
        let leader_url = error
            .leader_hint()
            .and_then(|leader| self.member_urls.get(leader).cloned());
        ApiError { error, leader_url }
    }

    fn check<T>(&self, res: crate::Result<T>) -> std::result::Result<T, ApiError> {
        res.map_err(|e| self.fail(e))
    }
}

fn ok(mut fields: Value) -> ApiResult {
    match fields.as_object_mut() {
        Some(map) => {
            map.insert("ok".into(), json!(true));
            Ok(Json(fields))
        }
        None => Ok(Json(json!({ "ok": true, "result": fields }))),
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Admin commands
        .route("/admin/addShard", post(add_shard))
        .route(
            "/admin/flushRoutingTableCacheUpdates",
            post(flush_routing_table_cache_updates),
        )
        .route(
            "/admin/flushDatabaseCacheUpdates",
            post(flush_database_cache_updates),
        )
        .route(
            "/admin/refreshLogicalSessionCacheNow",
            post(refresh_logical_session_cache_now),
        )
        .route("/admin/stepUp", post(step_up))
        .route("/admin/restart", post(restart))
        .route("/admin/insert", post(insert))
        .route("/admin/find", get(find))
        .route("/admin/createDatabase", post(create_database))
        .route("/admin/shardCollection", post(shard_collection))
        .route("/admin/split", post(split))
        .route("/admin/movePrimary", post(move_primary))
        .route("/admin/status", get(status))
        .route("/admin/shards", get(list_shards))
        // Replication
        .route("/raft/vote", post(raft_vote))
        .route("/raft/append", post(raft_append))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.admin.status();
    let member = status.members.iter().find(|m| m.id == state.member_id);
    let healthy = member.map(|m| m.running).unwrap_or(false);
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "unavailable" },
            "member": state.member_id,
            "role": member.and_then(|m| m.role),
            "phase": status.phase,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.admin.metrics().to_prometheus())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddShardRequest {
    add_shard: String,
}

async fn add_shard(State(state): State<AppState>, Json(req): Json<AddShardRequest>) -> ApiResult {
    let outcome = state.check(state.admin.add_shard(&req.add_shard).await)?;
    ok(json!({ "shardAdded": outcome.shard_id, "created": outcome.created }))
}

#[derive(Deserialize)]
struct NamespaceRequest {
    namespace: String,
}

async fn flush_routing_table_cache_updates(
    State(state): State<AppState>,
    Json(req): Json<NamespaceRequest>,
) -> ApiResult {
    state
        .admin
        .flush_routing_table_cache_updates(&req.namespace)
        .await;
    ok(json!({}))
}

#[derive(Deserialize)]
struct DatabaseRequest {
    db: String,
}

async fn flush_database_cache_updates(
    State(state): State<AppState>,
    Json(req): Json<DatabaseRequest>,
) -> ApiResult {
    state.admin.flush_database_cache_updates(&req.db).await;
    ok(json!({}))
}

async fn refresh_logical_session_cache_now(State(state): State<AppState>) -> ApiResult {
    let report = state.check(state.admin.refresh_logical_session_cache_now().await)?;
    ok(json!({ "report": report }))
}

#[derive(Deserialize)]
struct StepUpRequest {
    member: String,
}

async fn step_up(State(state): State<AppState>, Json(req): Json<StepUpRequest>) -> ApiResult {
    let leader = state.check(state.admin.step_up(&req.member).await)?;
    ok(json!({ "leader": leader }))
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartRequest {
    member: String,
    #[serde(default = "default_true")]
    preserve_state: bool,
    #[serde(default = "default_true")]
    wait: bool,
}

async fn restart(State(state): State<AppState>, Json(req): Json<RestartRequest>) -> ApiResult {
    let outcome = state.check(
        state
            .admin
            .restart(&req.member, req.preserve_state, req.wait)
            .await,
    )?;
    ok(json!({ "restart": outcome }))
}

#[derive(Deserialize)]
struct InsertRequest {
    namespace: String,
    document: Value,
}

async fn insert(State(state): State<AppState>, Json(req): Json<InsertRequest>) -> ApiResult {
    let id = state.check(state.admin.insert(&req.namespace, req.document).await)?;
    ok(json!({ "n": 1, "insertedId": id }))
}

#[derive(Deserialize)]
struct FindQuery {
    namespace: String,
    id: String,
}

async fn find(State(state): State<AppState>, Query(q): Query<FindQuery>) -> ApiResult {
    match state.check(state.admin.find_one(&q.namespace, &q.id).await)? {
        Some(document) => ok(json!({ "document": document })),
        None => Err(state.fail(Error::DocumentNotFound {
            namespace: q.namespace,
            id: q.id,
        })),
    }
}

#[derive(Deserialize)]
struct CreateDatabaseRequest {
    name: String,
}

async fn create_database(
    State(state): State<AppState>,
    Json(req): Json<CreateDatabaseRequest>,
) -> ApiResult {
    let db = state.check(state.admin.create_database(&req.name).await)?;
    ok(json!({ "database": db }))
}

async fn shard_collection(
    State(state): State<AppState>,
    Json(req): Json<NamespaceRequest>,
) -> ApiResult {
    let route = state.check(state.admin.shard_collection(&req.namespace).await)?;
    ok(json!({ "route": route }))
}

#[derive(Deserialize)]
struct SplitRequest {
    namespace: String,
    at: String,
}

async fn split(State(state): State<AppState>, Json(req): Json<SplitRequest>) -> ApiResult {
    let route = state.check(state.admin.split_chunk(&req.namespace, &req.at).await)?;
    ok(json!({ "route": route }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovePrimaryRequest {
    database: String,
    to_shard: String,
}

async fn move_primary(
    State(state): State<AppState>,
    Json(req): Json<MovePrimaryRequest>,
) -> ApiResult {
    let db = state.check(
        state
            .admin
            .move_primary(&req.database, &req.to_shard)
            .await,
    )?;
    ok(json!({ "database": db }))
}

async fn status(State(state): State<AppState>) -> ApiResult {
    ok(json!({ "status": state.admin.status() }))
}

async fn list_shards(State(state): State<AppState>) -> ApiResult {
    let shards = state.check(state.admin.list_shards().await)?;
    ok(json!({ "shards": shards }))
}

fn local_member(
    state: &AppState,
) -> std::result::Result<Arc<crate::replication::ReplicaNode>, ApiError> {
    state.replica_set.node(&state.member_id).ok_or_else(|| {
        state.fail(Error::Http(format!("member {} is not running", state.member_id)))
    })
}

async fn raft_vote(
    State(state): State<AppState>,
    Json(req): Json<VoteRequest>,
) -> std::result::Result<Json<VoteResponse>, ApiError> {
    let node = local_member(&state)?;
    state.check(node.handle_request_vote(req)).map(Json)
}

async fn raft_append(
    State(state): State<AppState>,
    Json(req): Json<AppendRequest>,
) -> std::result::Result<Json<AppendResponse>, ApiError> {
    let node = local_member(&state)?;
    state.check(node.handle_append_entries(req)).map(Json)
}
