//! HTTP surface.
//!
//! Every response uses the `{success, data?, meta?, error?}` envelope;
//! errors map through `AppError::into_response` and nowhere else. Role
//! gates are declared at the top of each handler via `claims.require`.

pub mod dashboard;
pub mod events;
pub mod financial;
pub mod imports;
pub mod kpi;
pub mod signups;

use crate::auth::Claims;
use crate::state::AppState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

/// Resolve `{page, limit}` / `{offset, limit}` pagination into a concrete
/// `(limit, offset)` window. `page` wins when both appear.
pub fn page_window(page: Option<u32>, offset: Option<u32>, limit: Option<u32>) -> (u32, u32) {
    let limit = limit.unwrap_or(50).min(500);
    let offset = match (page, offset) {
        (Some(page), _) => page.saturating_sub(1) * limit,
        (None, Some(offset)) => offset,
        (None, None) => 0,
    };
    (limit, offset)
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Success envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// Success envelope with pagination metadata.
pub fn ok_with_meta<T: Serialize>(data: T, meta: Meta) -> Response {
    Json(json!({ "success": true, "data": data, "meta": meta })).into_response()
}

/// All `/api/v1` routes. Auth middleware is layered on by the caller.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(events::router())
        .merge(signups::router())
        .merge(financial::router())
        .merge(imports::router())
        .merge(kpi::router())
        .merge(dashboard::router())
        .route("/ws", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Response {
    let bus = state.bus.clone();
    let send_timeout = Duration::from_secs(state.config.ws_send_timeout_secs);
    ws.on_upgrade(move |socket| {
        crate::bus::ws::run_session(socket, bus, claims.sub, claims.role, send_timeout)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window() {
        // page wins over offset
        assert_eq!(page_window(Some(3), Some(99), Some(20)), (20, 40));
        assert_eq!(page_window(None, Some(25), Some(10)), (10, 25));
        assert_eq!(page_window(None, None, None), (50, 0));
        // limit capped
        assert_eq!(page_window(None, None, Some(10_000)).0, 500);
        // page 0 treated as page 1
        assert_eq!(page_window(Some(0), None, Some(10)), (10, 0));
    }
}
