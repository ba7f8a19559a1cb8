pub mod dto;
pub mod handlers;
pub mod memory;
pub mod model;
pub mod service;
pub mod store;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::read_router())
        .merge(handlers::write_router())
}
