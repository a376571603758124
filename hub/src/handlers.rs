//! HTTP handlers: a thin translation from REST calls into core submissions
//! and store reads.

use std::collections::HashMap;

use armada_common::response;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::cache::keys;
use crate::error::HubError;
use crate::models::{
    ListClustersResponse, ListOperationsResponse, OperationType, SubmitResponse,
};
use crate::server::AppState;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

fn error_response(e: HubError) -> Response {
    let code = e.http_status();
    response::err_resp(e, code)
}

fn parse_id(raw: &str) -> Result<Uuid, HubError> {
    raw.parse()
        .map_err(|_| HubError::InvalidInput(format!("Invalid id: {raw}")))
}

/// Strict pagination parsing: malformed values are a 400, not a silent
/// default.
fn parse_pagination(params: &HashMap<String, String>) -> Result<(i64, i64), HubError> {
    let limit = match params.get("limit") {
        None => DEFAULT_LIMIT,
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| HubError::InvalidInput("Invalid limit parameter".into()))?,
    };
    if limit <= 0 {
        return Err(HubError::InvalidInput(
            "Invalid limit parameter: must be positive".into(),
        ));
    }
    let offset = match params.get("offset") {
        None => 0,
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| HubError::InvalidInput("Invalid offset parameter".into()))?,
    };
    if offset < 0 {
        return Err(HubError::InvalidInput(
            "Invalid offset parameter: must be non-negative".into(),
        ));
    }
    Ok((limit.min(MAX_LIMIT), offset))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let store_ok = state.registry.list(1, 0).await.is_ok();
    let cache_ok = match &state.cache {
        Some(cache) => Some(cache.ping().await),
        None => None,
    };
    let body = serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "connected_agents": state.orchestrator.connected_agents(),
        "cache": cache_ok,
    });
    if store_ok {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

pub async fn list_clusters(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (limit, offset) = match parse_pagination(&params) {
        Ok(page) => page,
        Err(e) => return error_response(e),
    };
    match state.registry.list(limit, offset).await {
        Ok((items, full_count)) => Json(ListClustersResponse {
            offset,
            limit,
            full_count,
            items,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_cluster(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let cluster_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match state.registry.get(cluster_id).await {
        Ok(Some(cluster)) => Json(cluster).into_response(),
        Ok(None) => error_response(HubError::NotFound(format!("cluster {cluster_id}"))),
        Err(e) => error_response(e),
    }
}

pub async fn delete_cluster(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let cluster_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match state.registry.delete(cluster_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_cluster_operations(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let cluster_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    let (limit, offset) = match parse_pagination(&params) {
        Ok(page) => page,
        Err(e) => return error_response(e),
    };
    match state.registry.get(cluster_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(HubError::NotFound(format!("cluster {cluster_id}"))),
        Err(e) => return error_response(e),
    }
    match state
        .operations
        .list_by_cluster(cluster_id, limit, offset)
        .await
    {
        Ok(items) => Json(ListOperationsResponse {
            offset,
            limit,
            items,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Multipart manifest upload (file field `manifests`), submitted to the
/// cluster's agent as an `apply_manifests` operation.
pub async fn apply_manifests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    let cluster_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    let mut manifests: Option<String> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("manifests") {
                    match field.text().await {
                        Ok(text) => manifests = Some(text),
                        Err(e) => {
                            return error_response(HubError::InvalidInput(format!(
                                "Invalid multipart upload: {e}"
                            )));
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                return error_response(HubError::InvalidInput(format!(
                    "Invalid multipart upload: {e}"
                )));
            }
        }
    }
    let Some(manifests) = manifests else {
        return error_response(HubError::InvalidInput(
            "Invalid upload: missing manifests field".into(),
        ));
    };
    if manifests.trim().is_empty() {
        return error_response(HubError::InvalidInput(
            "Invalid upload: manifests file is empty".into(),
        ));
    }

    let payload = serde_json::json!({ "manifests": manifests });
    match state
        .orchestrator
        .submit(
            cluster_id,
            OperationType::ApplyManifests,
            Some(payload),
            state.default_timeout_seconds,
        )
        .await
    {
        Ok(operation_id) => {
            (StatusCode::ACCEPTED, Json(SubmitResponse { operation_id })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Serve the cached resource snapshot when one exists; otherwise submit a
/// `list_resources` operation for the agent and hand back its id to poll.
pub async fn list_resources(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let cluster_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    let kind = match params.get("kind").map(String::as_str) {
        Some(kind) if !kind.is_empty() => kind.to_string(),
        _ => {
            return error_response(HubError::InvalidInput(
                "Invalid resources query: kind parameter is required".into(),
            ));
        }
    };
    let namespace = params.get("namespace").cloned().unwrap_or_default();

    if let Some(cache) = &state.cache {
        let key = keys::resource(cluster_id, &kind, &namespace, None);
        if let Some(snapshot) = cache.get::<serde_json::Value>(&key).await {
            return Json(snapshot).into_response();
        }
    }

    let payload = serde_json::json!({ "kind": kind, "namespace": namespace });
    match state
        .orchestrator
        .submit(
            cluster_id,
            OperationType::ListResources,
            Some(payload),
            state.default_timeout_seconds,
        )
        .await
    {
        Ok(operation_id) => {
            (StatusCode::ACCEPTED, Json(SubmitResponse { operation_id })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// The polling endpoint: every submitted operation has an observable
/// terminal state here.
pub async fn get_operation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let operation_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match state.operations.get(operation_id).await {
        Ok(Some(op)) => Json(op).into_response(),
        Ok(None) => error_response(HubError::NotFound(format!("operation {operation_id}"))),
        Err(e) => error_response(e),
    }
}

pub async fn cancel_operation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let operation_id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match state
        .orchestrator
        .cancel(operation_id, "cancelled by user")
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse { operation_id }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterInfo, Operation, OperationStatus};
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::registry::ClusterRegistry;
    use crate::server::router;
    use crate::session::SessionManager;
    use crate::store::OperationStore;
    use crate::store::memory::MemoryStore;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn test_state() -> (Router, AppState) {
        let store = MemoryStore::new();
        let registry = ClusterRegistry::new(Arc::new(store.clone()), None);
        let sessions = Arc::new(SessionManager::new(30));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            Arc::new(store.clone()),
            sessions.clone(),
            OrchestratorConfig::default(),
        );
        orchestrator.start().await.unwrap();
        let state = AppState {
            registry,
            operations: Arc::new(store),
            sessions,
            orchestrator,
            cache: None,
            channel_capacity: 64,
            default_timeout_seconds: 300,
        };
        (router(state.clone()), state)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn invalid_limit_is_a_400() {
        let (app, _state) = test_state().await;
        let response = app
            .oneshot(get("/clusters?limit=invalid"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"].as_str().unwrap().starts_with("Invalid"),
            "unexpected body: {body}"
        );
    }

    #[tokio::test]
    async fn unknown_cluster_is_a_404() {
        let (app, _state) = test_state().await;
        let response = app
            .oneshot(get(&format!("/clusters/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn clusters_are_listed_with_pagination() {
        let (app, state) = test_state().await;
        for i in 0..3 {
            state
                .registry
                .register(&format!("cluster-{i}"), None, ClusterInfo::default())
                .await
                .unwrap();
        }

        let response = app
            .clone()
            .oneshot(get("/clusters?limit=2&offset=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["full_count"], 3);

        // Limits above the cap are clamped, not rejected
        let response = app.oneshot(get("/clusters?limit=5000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["limit"], 100);
    }

    #[tokio::test]
    async fn manifest_upload_is_accepted() {
        let (app, state) = test_state().await;
        let cluster = state
            .registry
            .register("prod", None, ClusterInfo::default())
            .await
            .unwrap();

        let boundary = "hub-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"manifests\"; filename=\"ns.yaml\"\r\n\
             Content-Type: application/x-yaml\r\n\r\n\
             kind: Namespace\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri(format!("/clusters/{}/manifests", cluster.id))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let operation_id = body["operation_id"].as_str().unwrap().to_string();

        // The polling endpoint sees the operation immediately.
        let response = app
            .oneshot(get(&format!("/operations/{operation_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["type"], "apply_manifests");
        assert!(
            body["status"] == "pending" || body["status"] == "queued" || body["status"] == "running"
        );
    }

    #[tokio::test]
    async fn manifest_upload_without_the_field_is_a_400() {
        let (app, state) = test_state().await;
        let cluster = state
            .registry
            .register("prod", None, ClusterInfo::default())
            .await
            .unwrap();

        let boundary = "hub-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"other\"\r\n\r\n\
             nope\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri(format!("/clusters/{}/manifests", cluster.id))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn resources_require_a_kind_and_fall_back_to_submission() {
        let (app, state) = test_state().await;
        let cluster = state
            .registry
            .register("prod", None, ClusterInfo::default())
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!("/clusters/{}/resources", cluster.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get(&format!(
                "/clusters/{}/resources?kind=Pod&namespace=default",
                cluster.id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(body["operation_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn cancel_endpoint_conflicts_on_terminal_operations() {
        let (app, state) = test_state().await;
        let cluster = state
            .registry
            .register("prod", None, ClusterInfo::default())
            .await
            .unwrap();
        let op = Operation::new(cluster.id, OperationType::Describe, None, 60);
        state.operations.create(&op).await.unwrap();
        state
            .operations
            .set_finished(op.id, OperationStatus::Succeeded, "done")
            .await
            .unwrap();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/operations/{}/cancel", op.id))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cluster_operations_listing_404s_for_unknown_clusters() {
        let (app, _state) = test_state().await;
        let response = app
            .oneshot(get(&format!("/clusters/{}/operations", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
