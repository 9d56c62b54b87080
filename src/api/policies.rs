use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::action::Action;
use crate::error::Error;
use crate::AppState;

/// GET /policies
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    let reg = state.registry.lock();
    let doc = reg.render();
    Json(json!({ "policies": doc.get("policies").cloned().unwrap_or_default() }))
}

/// POST /policies
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

/// GET /policies/:name
pub async fn get_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let reg = state.registry.lock();
    let doc = reg.render();
    let found = doc
        .get("policies")
        .and_then(|l| l.as_array())
        .and_then(|l| l.iter().find(|p| p.get("name").and_then(|n| n.as_str()) == Some(&name)))
        .cloned();
    match found {
        Some(p) => Json(json!({ "policies": [p] })).into_response(),
        None => Error::NotFound(format!("policy {name}")).into_response(),
    }
}

/// DELETE /policies/:name
pub async fn delete_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    match reg.policy_by_name(&name) {
        Some(p) => {
            reg.policy_set_action(p, Action::Delete);
            Json(json!({ "result": "ok" })).into_response()
        }
        None => Error::NotFound(format!("policy {name}")).into_response(),
    }
}

/// DELETE /policies/:name/elements/:data
pub async fn delete_element(
    State(state): State<AppState>,
    Path((name, data)): Path<(String, String)>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    if let Err(e) = reg.element_delete(&name, &data) {
        return e.into_response();
    }
    match reg.rulerize_all() {
        Ok(()) => Json(json!({ "result": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}
