use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::action::Action;
use crate::error::Error;
use crate::AppState;

/// GET /farms
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    let reg = state.registry.lock();
    let doc = reg.render();
    Json(json!({ "farms": doc.get("farms").cloned().unwrap_or_default() }))
}

/// POST /farms
///
/// Accepts the same document shape as the configuration file; mutations are
/// applied in order and the consolidated rule set is emitted at the end.
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

/// GET /farms/:name
pub async fn get_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let reg = state.registry.lock();
    match reg.render_farm_by_name(&name) {
        Some(farm) => Json(json!({ "farms": [farm] })).into_response(),
        None => Error::NotFound(format!("farm {name}")).into_response(),
    }
}

/// DELETE /farms/:name
pub async fn delete_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    match reg.farm_by_name(&name) {
        Some(f) => {
            reg.farm_set_action(f, Action::Delete);
            Json(json!({ "result": "ok" })).into_response()
        }
        None => Error::NotFound(format!("farm {name}")).into_response(),
    }
}

/// DELETE /farms/:name/backends/:backend
pub async fn delete_backend(
    State(state): State<AppState>,
    Path((name, backend)): Path<(String, String)>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    let Some(f) = reg.farm_by_name(&name) else {
        return Error::NotFound(format!("farm {name}")).into_response();
    };
    let Some(b) = reg.farms[f].backend_by_name(&backend) else {
        return Error::NotFound(format!("backend {backend}")).into_response();
    };
    reg.backend_set_action(f, b, Action::Delete);
    Json(json!({ "result": "ok" })).into_response()
}

/// GET /farms/:name/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    match reg.farm_by_name(&name) {
        Some(f) => Json(reg.render_sessions(f)).into_response(),
        None => Error::NotFound(format!("farm {name}")).into_response(),
    }
}

/// DELETE /farms/:name/sessions/:client
pub async fn delete_session(
    State(state): State<AppState>,
    Path((name, client)): Path<(String, String)>,
) -> impl IntoResponse {
    let mut reg = state.registry.lock();
    if let Err(e) = reg.session_delete(&name, &client) {
        return e.into_response();
    }
    match reg.rulerize_all() {
        Ok(()) => Json(json!({ "result": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}
