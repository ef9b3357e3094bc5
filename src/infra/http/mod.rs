//! HTTP surface: `POST /convert`, `GET /health` and the shared middleware
//! stack.

mod convert;
mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, StatusCode, Uri, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::{catch_panic::CatchPanicLayer, set_header::SetResponseHeaderLayer};

use crate::application::{
    convert::Converter,
    error::{HttpError, MSG_NOT_FOUND},
    notify::NotificationQueue,
};

pub use middleware::{
    ClientIpSource, RequestContext, log_responses, panic_response, set_request_context,
};

#[derive(Clone)]
pub struct HttpState {
    pub converter: Arc<Converter>,
    pub notifications: NotificationQueue,
    pub client_ip: ClientIpSource,
}

pub fn build_router(state: HttpState, max_request_bytes: usize) -> Router {
    let notifications = state.notifications.clone();
    let client_ip = state.client_ip;
    let routes = Router::new()
        .route("/convert", post(convert::convert))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state);

    apply_middleware(routes, notifications, client_ip)
}

/// Wrap `router` in the panic guard, response logging, request context and
/// security header layers. The panic guard is innermost so a caught panic is
/// logged and notified like any other 500; the headers are outermost so every
/// response carries them.
pub fn apply_middleware(
    router: Router,
    notifications: NotificationQueue,
    client_ip: ClientIpSource,
) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(axum_middleware::from_fn_with_state(
            notifications,
            log_responses,
        ))
        .layer(axum_middleware::from_fn_with_state(
            client_ip,
            set_request_context,
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found(uri: Uri) -> HttpError {
    HttpError::new(
        "infra::http::not_found",
        StatusCode::NOT_FOUND,
        MSG_NOT_FOUND,
        format!("no route for `{}`", uri.path()),
    )
}
