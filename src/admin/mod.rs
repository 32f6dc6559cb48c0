//! Read-only status surface.

pub mod auth;
pub mod handlers;

use axum::{routing::get, Router};

use crate::http::server::AppState;

use self::handlers::get_status;

pub use auth::{AccessLevel, StatusAccess};

pub fn status_router() -> Router<AppState> {
    Router::new().route("/status", get(get_status))
}
