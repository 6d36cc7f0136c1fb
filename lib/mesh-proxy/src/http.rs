//! Response helpers shared by the proxy and admin listeners

use crate::context::is_hop_by_hop_header;
use crate::middleware::Rejection;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use mesh_core::CoreError;
use serde::Serialize;
use tracing::warn;

pub type HttpResponse = Response<Full<Bytes>>;

/// Plain text response
pub fn text(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// JSON response, falling back to a 500 when serialization fails
pub fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to serialize response body: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

pub fn empty(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Wrap a buffered upstream response for the server connection, dropping
/// hop-by-hop headers
pub fn full(response: Response<Bytes>) -> HttpResponse {
    let (mut parts, body) = response.into_parts();
    let hop_by_hop: Vec<_> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        parts.headers.remove(name);
    }
    Response::from_parts(parts, Full::new(body))
}

/// Client-visible response for a routing or registry error
pub fn error_response(err: &CoreError) -> HttpResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let reason = status.canonical_reason().unwrap_or("Error");
    text(status, format!("{}: {}\n", reason, err))
}

pub fn rejection_response(rejection: &Rejection) -> HttpResponse {
    let reason = rejection.status.canonical_reason().unwrap_or("Rejected");
    text(rejection.status, format!("{}: {}\n", reason, rejection.reason))
}

pub fn not_found() -> HttpResponse {
    text(StatusCode::NOT_FOUND, "Not Found\n")
}
