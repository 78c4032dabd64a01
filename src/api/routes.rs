//! API route definitions

use super::handlers::{self, LiveState};
use super::{sse_handlers, ws_handlers};
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: LiveState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // ====================================================================
        // Items
        // ====================================================================
        .route(
            "/items",
            get(handlers::list_items).post(handlers::create_item),
        )
        .route(
            "/items/{item_id}",
            get(handlers::get_item)
                .put(handlers::replace_item)
                .patch(handlers::patch_item)
                .delete(handlers::delete_item),
        )
        .route(
            "/items/{item_id}/events",
            get(sse_handlers::item_sse_events),
        )
        // ====================================================================
        // Change streams
        // ====================================================================
        .route("/events", get(sse_handlers::sse_events))
        .route("/events/ws", get(ws_handlers::ws_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
