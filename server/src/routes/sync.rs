//! Full-overwrite push endpoint.

use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;
use tabsync_engine::{validate_unique_ids, Entity, PushBody};

use crate::confirm::ConfirmOverwrite;
use crate::error::Result;
use crate::AppState;

/// Response for a push.
#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub ok: bool,
    pub collection: String,
    pub count: usize,
}

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/api/sync", post(push_handler))
}

/// POST /api/sync - Replace a whole collection.
///
/// Realtime clients are not notified: sibling tabs of the pusher learn about
/// the change through their cross-tab channel.
async fn push_handler(
    State(state): State<AppState>,
    _confirm: ConfirmOverwrite,
    Json(body): Json<PushBody>,
) -> Result<Json<PushResponse>> {
    let collection = body
        .collection
        .unwrap_or_else(|| state.config.default_collection.clone());

    let items = body
        .items
        .into_iter()
        .map(Entity::new)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    validate_unique_ids(&collection, &items)?;

    let count = state.store.replace(&collection, items);
    tracing::info!(collection = %collection, count, "Collection overwritten by push");

    Ok(Json(PushResponse {
        ok: true,
        collection,
        count,
    }))
}
