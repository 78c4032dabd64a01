//! HTTP API: item CRUD plus SSE and WebSocket change streams

pub mod handlers;
pub mod query;
pub mod routes;
pub mod sse_handlers;
pub mod ws_handlers;

pub use handlers::{AppError, LiveState, ServerState};
pub use query::*;
pub use routes::create_router;
