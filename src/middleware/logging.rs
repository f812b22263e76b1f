//! Request logging middleware.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn, Instrument};

/// Logs method, path, status and latency for every request except `/health`.
/// Requests that touch a specific execution carry its id on the span.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let execution_id = execution_id_from_path(&path).unwrap_or_default();
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        execution_id = %execution_id,
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    let _guard = span.enter();
    if status >= 500 {
        warn!(status, latency_ms, "Request failed (5xx)");
    } else if status >= 400 {
        info!(status, latency_ms, "Request rejected (4xx)");
    } else {
        info!(status, latency_ms, "Request completed");
    }

    response
}

fn execution_id_from_path(path: &str) -> Option<String> {
    let mut parts = path.trim_start_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("api"), Some("executions" | "results"), Some(id)) if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}
