//! HTTP/WebSocket front-end.

mod error;
mod handlers;
mod routes;
mod ws;

pub use error::{ApiError, ApiResult};
pub use routes::{router, ApiState};
