use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::headers::Headers;
use crate::request::RequestEnvelope;
use crate::snapshot::{ServerInfo, ServerSnapshot};

pub type Body = Full<Bytes>;

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    pub headers: Headers,
}

/// The record every handler reports back: who asked, who answered, and
/// what was asked.
#[derive(Debug, Clone, Serialize)]
pub struct EchoResponse {
    pub id: String,
    pub client: ClientInfo,
    pub server: ServerInfo,
    pub request: RequestInfo,
}

impl EchoResponse {
    pub fn build(envelope: RequestEnvelope, snapshot: &ServerSnapshot) -> Self {
        Self {
            id: envelope.id,
            client: ClientInfo {
                address: envelope.remote_address,
            },
            server: snapshot.info(),
            request: RequestInfo {
                path: envelope.path,
                query: envelope.query,
                method: envelope.method,
                body: envelope.body,
                headers: envelope.headers,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub info: EchoResponse,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "errorCode")]
    pub error_code: u16,
}

/// Pretty output uses a four space indent.
pub fn encode<T: Serialize>(value: &T, pretty: bool) -> serde_json::Result<Vec<u8>> {
    if !pretty {
        return serde_json::to_vec(value);
    }
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new() -> Self {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.body = Bytes::from(body);
        self.with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    pub fn with_text_body(mut self, body: &str) -> Self {
        self.body = Bytes::copy_from_slice(body.as_bytes());
        self.with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
    }

    pub fn build(self) -> Response<Body> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}
