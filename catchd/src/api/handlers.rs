//! Plain API handlers.

use axum::extract::State;
use axum::Json;

use super::error::ApiResult;
use super::routes::ApiState;
use crate::daemon::{server_info, ServerInfo};
use crate::store::Service;

/// GET /api/v0/info
pub async fn info() -> Json<ServerInfo> {
    Json(server_info())
}

/// GET /api/v0/services
pub async fn services(
    State(state): State<ApiState>,
) -> ApiResult<Json<std::collections::BTreeMap<String, Service>>> {
    Ok(Json(state.daemon.store.get().services))
}
