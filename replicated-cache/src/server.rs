//! HTTP front end: client reads and writes plus the cluster join endpoint.
//!
//! Reads are served from the local store and may be stale on followers.
//! Writes go through the [`ClusterCoordinator`]. Every reply's HTTP status
//! equals its `retcode`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::command::{Command, CommandOp, ForwardedWrite};
use crate::coordinator::{ClusterCoordinator, ClusterStatus};
use crate::error::{CacheError, Result};
use crate::protocol::{routes, HttpReply, JoinRequest, JoinResult};
use crate::store::KvStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<KvStore>,
    pub coordinator: Arc<ClusterCoordinator>,
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.retcode).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for JoinResult {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.retcode).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(routes::GET, get(handle_get))
        .route(routes::KEYS, get(handle_keys))
        .route(routes::SET, post(handle_set))
        .route(routes::DEL, post(handle_del))
        .route(routes::JOIN, post(handle_join))
        .route(routes::CLUSTER, get(handle_cluster))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn reply<T: serde::Serialize>(result: Result<T>) -> HttpReply {
    match result.and_then(|data| Ok(serde_json::to_value(data)?)) {
        Ok(data) => HttpReply::ok(data),
        Err(err) => HttpReply::error(&err),
    }
}

async fn handle_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> HttpReply {
    let result = params
        .get("key")
        .ok_or_else(|| CacheError::Decode("missing query parameter `key`".to_string()))
        .and_then(|key| state.store.get(key));
    reply(result)
}

async fn handle_keys(State(state): State<AppState>) -> HttpReply {
    HttpReply::ok(json!(state.store.keys()))
}

async fn handle_set(State(state): State<AppState>, body: Bytes) -> HttpReply {
    write(&state, routes::SET, CommandOp::Set, &body).await
}

async fn handle_del(State(state): State<AppState>, body: Bytes) -> HttpReply {
    write(&state, routes::DEL, CommandOp::Delete, &body).await
}

/// The route decides the operation; the body only carries operands.
async fn write(state: &AppState, uri: &str, op: CommandOp, body: &[u8]) -> HttpReply {
    let write = match serde_json::from_slice::<ForwardedWrite>(body) {
        Ok(write) => write,
        Err(err) => return HttpReply::error(&CacheError::from(err)),
    };
    let result = state
        .coordinator
        .apply(uri, Command::new(op, write.datas))
        .await;
    reply(result.map(|()| serde_json::Value::Null))
}

async fn handle_join(State(state): State<AppState>, body: Bytes) -> JoinResult {
    match serde_json::from_slice::<JoinRequest>(&body) {
        Ok(req) => state.coordinator.join_handler(req).await,
        Err(err) => JoinResult::error(&CacheError::from(err)),
    }
}

async fn handle_cluster(State(state): State<AppState>) -> Json<ClusterStatus> {
    Json(state.coordinator.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Role;
    use crate::testing::{FakeEngine, RecordingTransport};
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn app(engine: &Arc<FakeEngine>, transport: &Arc<RecordingTransport>) -> (Router, Arc<ClusterCoordinator>) {
        let coordinator = Arc::new(ClusterCoordinator::new(
            "127.0.0.1:6380",
            "127.0.0.1:6381",
            engine.clone(),
            transport.clone(),
        ));
        let state = AppState {
            store: engine.fsm.store().clone(),
            coordinator: coordinator.clone(),
        };
        (router(state), coordinator)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn set_get_delete_on_leader() {
        let engine = FakeEngine::new(Role::Leader, Some("127.0.0.1:6381"));
        let transport = Arc::new(RecordingTransport::default());
        let (app, _) = app(&engine, &transport);

        let (status, body) = send(app.clone(), post_json("/set", json!({"datas": ["a", "1", "b", "2"]}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retcode"], 200);

        let (status, body) = send(app.clone(), get_req("/get?key=a")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "1");

        // A forwarded body's op is ignored; the route decides.
        let (status, _) = send(app.clone(), post_json("/del", json!({"op": 0, "datas": ["a"]}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(app.clone(), get_req("/get?key=a")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["retcode"], 404);
        assert_eq!(body["retdesc"], "key is not exist");

        let (_, body) = send(app, get_req("/keys")).await;
        assert_eq!(body["data"], json!(["b"]));
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let engine = FakeEngine::new(Role::Leader, Some("127.0.0.1:6381"));
        let transport = Arc::new(RecordingTransport::default());
        let (app, _) = app(&engine, &transport);

        let (status, _) = send(app.clone(), get_req("/get")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/set")
            .body(Body::from("not json"))
            .unwrap();
        let (status, body) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["retcode"], 400);
        assert!(engine.submitted.lock().is_empty());

        let (status, body) = send(app, post_json("/join", json!({"http": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["retcode"], 400);
    }

    #[tokio::test]
    async fn write_without_leader_is_unavailable() {
        let engine = FakeEngine::new(Role::Follower, None);
        let transport = Arc::new(RecordingTransport::default());
        let (app, _) = app(&engine, &transport);

        let (status, body) = send(app, post_json("/set", json!({"datas": ["a", "1"]}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retdesc"], "no leader available");
    }

    #[tokio::test]
    async fn join_on_leader_returns_membership() {
        let engine = FakeEngine::new(Role::Leader, Some("127.0.0.1:6381"));
        let transport = Arc::new(RecordingTransport::default());
        let (app, coordinator) = app(&engine, &transport);

        let (status, body) = send(
            app.clone(),
            post_json("/join", json!({"http": "127.0.0.1:7380", "raft": "127.0.0.1:7381"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result: JoinResult = serde_json::from_value(body).unwrap();
        assert_eq!(result.datas, coordinator.membership());
        assert_eq!(result.datas.len(), 2);

        let (_, body) = send(app, get_req("/cluster")).await;
        assert_eq!(body["role"], "leader");
        assert_eq!(body["leader"], "127.0.0.1:6381");
        assert_eq!(body["members"]["127.0.0.1:7381"], "127.0.0.1:7380");
    }
}
