use std::net::SocketAddr;

use hyper::header::{HeaderMap, HeaderValue};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request correlation data handed to every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub id: String,
    pub remote_addr: SocketAddr,
}

impl RequestContext {
    /// Resolves the correlation id for an inbound request, injecting a fresh
    /// one into `headers` when the caller did not send one.
    pub fn attach(headers: &mut HeaderMap, remote_addr: SocketAddr) -> Self {
        Self {
            id: ensure_request_id(headers),
            remote_addr,
        }
    }
}

/// A random uuid with the hyphens stripped.
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn ensure_request_id(headers: &mut HeaderMap) -> String {
    let existing = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(id) = existing {
        return id.to_string();
    }

    let id = new_request_id();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    id
}
