//! Per-collection document routes.
//!
//! Reads serve the engine's pull. Single-document writes are the out-of-band
//! path (scripts, automation); each one tells realtime clients to pull.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tabsync_engine::Entity;

use crate::error::{AppError, Result};
use crate::store::Upsert;
use crate::websocket::ServerMessage;
use crate::AppState;

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/{collection}", get(list_handler))
        .route(
            "/api/{collection}/{id}",
            get(get_handler).put(put_handler).delete(delete_handler),
        )
}

/// GET /api/{collection} - Summaries of every document.
async fn list_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Json<Vec<Value>> {
    Json(state.store.list(&collection))
}

/// GET /api/{collection}/{id} - One full document.
async fn get_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    state
        .store
        .get(&collection, &id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))
}

/// PUT /api/{collection}/{id} - Create or replace one document.
async fn put_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(mut document): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let Some(fields) = document.as_object_mut() else {
        return Err(AppError::BadRequest("document must be a JSON object".into()));
    };
    match fields.get("id") {
        None => {
            fields.insert("id".into(), Value::String(id.clone()));
        }
        Some(Value::String(body_id)) if *body_id == id => {}
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "body id {other} does not match path id {id}"
            )));
        }
    }

    let entity = Entity::new(document)?;
    let body = entity.as_value().clone();
    let status = match state.store.upsert(&collection, entity) {
        Upsert::Created => StatusCode::CREATED,
        Upsert::Updated => StatusCode::OK,
    };
    notify(&state, &collection);
    Ok((status, Json(body)))
}

/// DELETE /api/{collection}/{id} - Remove one document.
async fn delete_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    if !state.store.remove(&collection, &id) {
        return Err(AppError::NotFound(format!("{collection}/{id}")));
    }
    notify(&state, &collection);
    Ok(StatusCode::NO_CONTENT)
}

fn notify(state: &AppState, collection: &str) {
    let sent = state
        .conn_manager
        .broadcast_all(ServerMessage::sync(collection));
    tracing::debug!(collection, sent_to = sent, "Notified realtime clients");
}
