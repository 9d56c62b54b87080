pub mod addresses;
pub mod farms;
pub mod policies;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::Router;

use crate::error::Error;
use crate::AppState;

/// Build the full admin API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // ── Farms ──────────────────────────────────────────────────
        .route("/farms", get(farms::list).post(farms::post))
        .route("/farms/:name", get(farms::get_one).delete(farms::delete_one))
        .route("/farms/:name/backends/:backend", delete(farms::delete_backend))
        .route("/farms/:name/sessions", get(farms::list_sessions))
        .route("/farms/:name/sessions/:client", delete(farms::delete_session))
        // ── Policies ───────────────────────────────────────────────
        .route("/policies", get(policies::list).post(policies::post))
        .route(
            "/policies/:name",
            get(policies::get_one).delete(policies::delete_one),
        )
        .route("/policies/:name/elements/:data", delete(policies::delete_element))
        // ── Addresses ──────────────────────────────────────────────
        .route("/addresses", get(addresses::list).post(addresses::post))
        .route(
            "/addresses/:name",
            get(addresses::get_one).delete(addresses::delete_one),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .with_state(state)
}

/// Admin requests authenticate with a `Key` header when a key is configured.
async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(key) = &state.auth_key {
        let provided = req.headers().get("Key").and_then(|v| v.to_str().ok());
        if provided != Some(key.as_str()) {
            return Error::Auth.into_response();
        }
    }
    next.run(req).await
}
