//! The inspection surface.
//!
//! Grounded on `erankavija-just-in-time`'s `routes.rs` for the axum
//! plumbing (`Router::new().route(path, get(handler).put(handler))`,
//! `State`/`Path`/`Json` extractors, `StatusCode` error mapping) and on
//! `holonic_engine/interface/app.py`'s `InterfaceHolon` route table for the
//! shape of each endpoint. The interface agent itself (id all-zeros) lives
//! in the same [`crate::agent::AgentTree`] as every other agent — this
//! module is just read/write HTTP views over it, not a separate store.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::message::Message;
use crate::agent::AgentTree;
use crate::error::{AgentError, PathError};

type AppState = Arc<AgentTree>;

/// Build the inspection surface's router over `tree`.
pub fn router(tree: Arc<AgentTree>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/holon/:id", get(get_holon))
        .route("/api/holon/:id/hud", get(get_hud))
        .route("/api/holon/:id/purpose", get(get_purpose).put(put_purpose))
        .route("/api/holon/:id/self", get(get_self).put(put_self))
        .route(
            "/api/holon/:id/knowledge",
            get(get_knowledge).put(put_knowledge).delete(delete_knowledge),
        )
        .route("/api/holon/:id/action/:name", post(execute_action))
        .route("/api/holon/:id/messages", get(get_messages))
        .route("/api/holon/:id/message", post(send_message))
        .route("/api/holon/:id/child", post(create_child))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(tree)
}

/// Serve the inspection surface on `addr` until the process is killed.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot bind.
pub async fn serve(tree: Arc<AgentTree>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let app = router(tree);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "inspection surface listening");
    axum::serve(listener, app).await
}

#[derive(Debug, Deserialize)]
struct PutBody {
    #[serde(default)]
    path: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct KnowledgeQuery {
    #[serde(default)]
    path: String,
}

fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn bad_request() -> StatusCode {
    StatusCode::BAD_REQUEST
}

async fn get_holon(State(tree): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, StatusCode> {
    tree.full_state(id).await.map(Json).ok_or_else(not_found)
}

async fn get_hud(State(tree): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, StatusCode> {
    tree.hud(id).await.map(Json).ok_or_else(not_found)
}

async fn get_purpose(State(tree): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    let guard = node.read().await;
    let no_agents = |_: &str| Value::Null;
    Ok(Json(guard.purpose().serialize(&no_agents)))
}

async fn put_purpose(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PutBody>,
) -> Result<Json<Value>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    {
        let mut guard = node.write().await;
        if body.path.is_empty() {
            if body.value.is_object() {
                *guard.purpose_mut() = crate::binding::Bindings::from_static_json(&body.value);
            }
        } else {
            guard.purpose_set(&body.path, body.value.clone());
        }
    }
    let guard = node.read().await;
    let no_agents = |_: &str| Value::Null;
    Ok(Json(json!({"success": true, "purpose": guard.purpose().serialize(&no_agents)})))
}

async fn get_self(State(tree): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    let guard = node.read().await;
    let no_agents = |_: &str| Value::Null;
    Ok(Json(guard.self_bindings().serialize(&no_agents)))
}

async fn put_self(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PutBody>,
) -> Result<Json<Value>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    {
        let mut guard = node.write().await;
        if body.path.is_empty() {
            if body.value.is_object() {
                *guard.self_bindings_mut() = crate::binding::Bindings::from_static_json(&body.value);
            }
        } else {
            guard.self_set(&body.path, body.value.clone());
        }
    }
    let guard = node.read().await;
    let no_agents = |_: &str| Value::Null;
    Ok(Json(json!({"success": true, "self": guard.self_bindings().serialize(&no_agents)})))
}

async fn get_knowledge(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<KnowledgeQuery>,
) -> Result<Json<Value>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    let guard = node.read().await;
    if query.path.is_empty() {
        return Ok(Json(guard.knowledge().clone()));
    }
    guard
        .knowledge_get(&query.path)
        .map(|v| Json(json!({"value": v})))
        .map_err(|_| not_found())
}

async fn put_knowledge(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PutBody>,
) -> Result<Json<Value>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    let mut guard = node.write().await;
    if body.path.is_empty() {
        guard.set_knowledge(body.value.clone());
    } else {
        guard.knowledge_set(&body.path, body.value.clone()).map_err(|_| bad_request())?;
    }
    Ok(Json(json!({"success": true, "knowledge": guard.knowledge()})))
}

async fn delete_knowledge(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<KnowledgeQuery>,
) -> Result<Json<Value>, StatusCode> {
    if query.path.is_empty() {
        return Err(bad_request());
    }
    let node = tree.get(id).await.ok_or_else(not_found)?;
    let mut guard = node.write().await;
    guard.knowledge_delete(&query.path).map_err(|err| match err {
        AgentError::Path(PathError::NotFound(_)) => not_found(),
        _ => bad_request(),
    })?;
    Ok(Json(json!({"success": true})))
}

async fn execute_action(
    State(tree): State<AppState>,
    Path((id, name)): Path<(Uuid, String)>,
    params: Option<Json<std::collections::BTreeMap<String, Value>>>,
) -> Result<Json<Value>, StatusCode> {
    if tree.get(id).await.is_none() {
        return Err(not_found());
    }
    let kwargs = params.map(|Json(v)| v).unwrap_or_default();
    tree.apply_action(id, &name, &kwargs)
        .await
        .map(|result| Json(json!({"success": true, "result": result})))
        .map_err(|_| bad_request())
}

async fn get_messages(State(tree): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Vec<Message>>, StatusCode> {
    let node = tree.get(id).await.ok_or_else(not_found)?;
    let guard = node.read().await;
    Ok(Json(guard.inbox().all().to_vec()))
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    #[serde(default)]
    recipient_ids: Vec<Uuid>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    tokens: i64,
}

async fn send_message(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<SendMessageBody>>,
) -> Result<Json<Value>, StatusCode> {
    let Json(body) = body.unwrap_or(Json(SendMessageBody {
        recipient_ids: Vec::new(),
        content: Value::Null,
        tokens: 0,
    }));
    let message = tree
        .send_message(id, body.recipient_ids, body.content, body.tokens)
        .await
        .map_err(|_| bad_request())?;
    Ok(Json(json!({"success": true, "message": message})))
}

#[derive(Debug, Default, Deserialize)]
struct CreateChildBody {
    template_id: Option<Uuid>,
}

async fn create_child(
    State(tree): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CreateChildBody>>,
) -> Result<Json<Value>, StatusCode> {
    let template_id = body.and_then(|Json(b)| b.template_id);
    let child_id = tree.create_child(id, template_id).await.map_err(|_| bad_request())?;
    let token_bank = tree
        .get(child_id)
        .await
        .map(|node| async move { node.read().await.token_bank() });
    let token_bank = match token_bank {
        Some(fut) => fut.await,
        None => 0,
    };
    Ok(Json(json!({"success": true, "child": {"id": child_id.to_string(), "token_bank": token_bank}})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn tree() -> Arc<AgentTree> {
        Arc::new(AgentTree::new(Arc::new(HeuristicTokenCounter)))
    }

    #[tokio::test]
    async fn get_holon_for_missing_id_returns_404() {
        let app = router(tree());
        let response = app
            .oneshot(Request::builder().uri(format!("/api/holon/{}", Uuid::new_v4())).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_holon_for_root_returns_200() {
        let tree = tree();
        let root = tree.root_id();
        let app = router(tree);
        let response = app
            .oneshot(Request::builder().uri(format!("/api/holon/{root}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_knowledge_then_get_round_trips() {
        let tree = tree();
        let root = tree.root_id();
        let app = router(tree);

        let put = Request::builder()
            .method("PUT")
            .uri(format!("/api/holon/{root}/knowledge"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json!({"path": "x", "value": 42})).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(put).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let get = Request::builder()
            .uri(format!("/api/holon/{root}/knowledge?path=x"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(get).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_knowledge_without_path_is_bad_request() {
        let tree = tree();
        let root = tree.root_id();
        let app = router(tree);
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/holon/{root}/knowledge"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
