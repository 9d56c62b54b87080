pub mod action;
pub mod address;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod farm;
pub mod farmaddress;
pub mod net;
pub mod nft;
pub mod parser;
pub mod policy;
pub mod registry;
pub mod session;

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared application state passed to all API handlers.
///
/// The registry is the only shared mutable state in the process; the mutex
/// serializes admin requests so the model is never observed mid-mutation.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Mutex<registry::Registry>>,
    pub auth_key: Option<String>,
}
