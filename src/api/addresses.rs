use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::error::Error;
use crate::AppState;

/// GET /addresses
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    let reg = state.registry.lock();
    let doc = reg.render();
    Json(json!({ "addresses": doc.get("addresses").cloned().unwrap_or_default() }))
}

/// POST /addresses
pub async fn post(
    State(state): State<AppState>,
    Json(doc): Json<serde_json::Value>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    if let Err(e) = reg.load_json(&doc) {
        return e.into_response();
    }
    match reg.rulerize_all() {
        Ok(()) => Json(json!({ "result": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /addresses/:name
pub async fn get_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let reg = state.registry.lock();
    let doc = reg.render();
    let found = doc
        .get("addresses")
        .and_then(|l| l.as_array())
        .and_then(|l| l.iter().find(|a| a.get("name").and_then(|n| n.as_str()) == Some(&name)))
        .cloned();
    match found {
        Some(a) => Json(json!({ "addresses": [a] })).into_response(),
        None => Error::NotFound(format!("address {name}")).into_response(),
    }
}

/// DELETE /addresses/:name
pub async fn delete_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    match reg.address_by_name(&name) {
        Some(a) => {
            reg.address_delete(a);
            Json(json!({ "result": "ok" })).into_response()
        }
        None => Error::NotFound(format!("address {name}")).into_response(),
    }
}
