use std::{any::Any, net::SocketAddr, time::Instant};

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::{
    error::{ErrorReport, HttpError, MSG_INTERNAL},
    notify::NotificationQueue,
};

const CLOUDFLARE_IP_HEADER: &str = "cf-connecting-ip";

/// Where the logged client address comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientIpSource {
    /// The TCP peer of the connection.
    #[default]
    Peer,
    /// `CF-Connecting-IP` when the request carries it, the TCP peer otherwise.
    Cloudflare,
}

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: Option<String>,
}

pub async fn set_request_context(
    State(source): State<ClientIpSource>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
        client_ip: client_ip(&request, source),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

fn client_ip(request: &Request<Body>, source: ClientIpSource) -> Option<String> {
    if source == ClientIpSource::Cloudflare {
        let forwarded = request
            .headers()
            .get(CLOUDFLARE_IP_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Declared `Content-Length`, falling back to an exact body size hint.
fn body_length<B: HttpBody>(headers: &HeaderMap, body: &B) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .or_else(|| body.size_hint().exact())
}

/// Log every response and enqueue an operator notification for server
/// errors. Client errors are logged at `warn` and never notify.
pub async fn log_responses(
    State(notifications): State<NotificationQueue>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let (request_id, client_ip) = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| (ctx.request_id.clone(), ctx.client_ip.clone()))
        .unwrap_or_default();
    let client_ip = client_ip.unwrap_or_else(|| "-".to_string());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let request_bytes = body_length(request.headers(), request.body());

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();
    let response_bytes = body_length(response.headers(), response.body());

    if !(status.is_client_error() || status.is_server_error()) {
        info!(
            target = "folio::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = elapsed_ms,
            client_ip = %client_ip,
            user_agent = %user_agent,
            request_bytes = request_bytes,
            response_bytes = response_bytes,
            request_id = request_id,
            "request completed",
        );
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "folio::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            client_ip = %client_ip,
            user_agent = %user_agent,
            request_bytes = request_bytes,
            response_bytes = response_bytes,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = request_id,
            "request failed",
        );

        let chain = if messages.is_empty() {
            detail
        } else {
            messages.join("\n")
        };
        notifications.notify(
            format!("folio: {} on {} {}", status.as_u16(), method, uri.path()),
            format!("request_id: {request_id}\nclient_ip: {client_ip}\nsource: {source}\n\n{chain}"),
        );
    } else {
        warn!(
            target = "folio::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            client_ip = %client_ip,
            user_agent = %user_agent,
            request_bytes = request_bytes,
            response_bytes = response_bytes,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = request_id,
            "client request error",
        );
    }

    response
}

/// Turn a caught handler panic into a JSON 500 carrying the panic message in
/// its private report.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "panic with non-string payload".to_string()
    };

    HttpError::new(
        "infra::http::panic",
        StatusCode::INTERNAL_SERVER_ERROR,
        MSG_INTERNAL,
        format!("handler panicked: {detail}"),
    )
    .into_response()
}
