//! Per-request trace ids.
//!
//! Every request gets a trace id (inbound `x-trace-id` header or a fresh
//! one), echoed back as `X-Trace-Id` and attached to one structured
//! `http_request` log line per request.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;
use uuid::Uuid;

pub const TRACE_HEADER: &str = "x-trace-id";
const MAX_TRACE_ID_LEN: usize = 128;

/// Trim, cap, and drop empty candidate trace ids.
pub fn normalize_trace_id(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_TRACE_ID_LEN).collect())
}

pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn ensure_trace_id(value: Option<&str>) -> String {
    normalize_trace_id(value).unwrap_or_else(generate_trace_id)
}

pub async fn trace_middleware(request: Request, next: Next) -> Response {
    let trace_id = ensure_trace_id(
        request
            .headers()
            .get(TRACE_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = std::time::Instant::now();

    let mut response = next.run(request).await;

    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(
        component = "api",
        event = "http_request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status_code = response.status().as_u16(),
        duration_ms = format!("{duration_ms:.2}"),
    );

    if let Ok(header) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("x-trace-id", header);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_trims_and_caps() {
        assert_eq!(normalize_trace_id(Some("  abc  ")).as_deref(), Some("abc"));
        assert_eq!(normalize_trace_id(Some("   ")), None);
        assert_eq!(normalize_trace_id(None), None);
        let long = "x".repeat(300);
        assert_eq!(normalize_trace_id(Some(&long)).unwrap().len(), 128);
    }

    #[test]
    fn ensure_generates_when_missing() {
        let generated = ensure_trace_id(None);
        assert_eq!(generated.len(), 32);
        assert_eq!(ensure_trace_id(Some("given")), "given");
    }
}
