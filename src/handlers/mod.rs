use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use hyper::body::Body as HttpBody;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::ServerOptions;
use crate::request_id::RequestContext;
use crate::response::{Body, ErrorBody, HttpResponse, encode};
use crate::snapshot::ServerSnapshot;

mod echo_json;
mod health;
pub mod websocket;

pub use echo_json::EchoJson;
pub use health::HealthCheck;
pub use websocket::WebSocketEcho;

// Handler error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub status_code: StatusCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn to_response(&self) -> Response<Body> {
        let body = ErrorBody {
            message: self.message.clone(),
            error_code: self.status_code.as_u16(),
        };
        let response = HttpResponse::new().with_status(self.status_code);
        match encode(&body, false) {
            Ok(json) => response.with_json_body(json),
            Err(_) => response.with_text_body(&self.message),
        }
        .build()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status_code, self.message)
    }
}

/// Encodes `value` as pretty JSON. An encoding failure is logged with the
/// value and becomes a 500.
pub fn json_response<T>(status: StatusCode, value: &T) -> Result<Response<Body>, HandlerError>
where
    T: Serialize + fmt::Debug,
{
    let body = encode(value, true).map_err(|e| {
        error!(error = %e, value = ?value, "unable to marshal response");
        HandlerError::internal("unable to marshal response")
    })?;
    Ok(HttpResponse::new().with_status(status).with_json_body(body).build())
}

/// The fixed set of lifecycle-managed handlers.
#[derive(Debug)]
pub enum Handler {
    EchoJson(EchoJson),
    HealthCheck(HealthCheck),
    WebSocket(WebSocketEcho),
}

impl Handler {
    pub fn start(&mut self) {
        match self {
            Handler::EchoJson(h) => h.start(),
            Handler::HealthCheck(h) => h.start(),
            Handler::WebSocket(h) => h.start(),
        }
    }

    pub fn stop(&self) {
        match self {
            Handler::EchoJson(h) => h.stop(),
            Handler::HealthCheck(h) => h.stop(),
            Handler::WebSocket(h) => h.stop(),
        }
    }

    pub fn is_started(&self) -> bool {
        match self {
            Handler::EchoJson(h) => h.is_started(),
            Handler::HealthCheck(h) => h.is_started(),
            Handler::WebSocket(h) => h.is_started(),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>, ctx: &RequestContext) -> Response<Body>
    where
        B: HttpBody + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !self.is_started() {
            return HandlerError::new(StatusCode::SERVICE_UNAVAILABLE, "handler not started")
                .to_response();
        }
        let result = match self {
            Handler::EchoJson(h) => h.handle(req, ctx).await,
            Handler::HealthCheck(h) => h.handle(req, ctx).await,
            Handler::WebSocket(h) => h.handle(req, ctx).await,
        };
        result.unwrap_or_else(|e| e.to_response())
    }
}

/// Path to handler bindings. Every handler is started before it becomes
/// reachable through [`HandlerRegistry::dispatch`].
#[derive(Debug)]
pub struct HandlerRegistry {
    bindings: BTreeMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn register<I>(bindings: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Handler)>,
    {
        let mut registered = BTreeMap::new();
        for (path, mut handler) in bindings {
            if registered.contains_key(&path) {
                bail!("duplicate handler for path {}", path);
            }
            handler.start();
            debug!(path = %path, "handler started");
            registered.insert(path, handler);
        }
        Ok(Self {
            bindings: registered,
        })
    }

    /// `/` echo, `/healthcheck` and `/echo` sharing one snapshot.
    pub fn standard(snapshot: &ServerSnapshot, options: &ServerOptions) -> Result<Self> {
        Self::register([
            (
                "/".to_string(),
                Handler::EchoJson(EchoJson::new(snapshot.clone())),
            ),
            (
                "/healthcheck".to_string(),
                Handler::HealthCheck(HealthCheck::new(snapshot.clone())),
            ),
            (
                "/echo".to_string(),
                Handler::WebSocket(WebSocketEcho::new(
                    snapshot.clone(),
                    options.websocket_grace(),
                )),
            ),
        ])
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn shutdown_all(&self) {
        for (path, handler) in &self.bindings {
            info!(path = %path, "signaling handler");
            handler.stop();
        }
    }

    /// Exact match first, then the `/` catch-all if one is bound.
    pub fn route(&self, path: &str) -> Option<&Handler> {
        self.bindings.get(path).or_else(|| self.bindings.get("/"))
    }

    pub async fn dispatch<B>(&self, mut req: Request<B>, remote_addr: SocketAddr) -> Response<Body>
    where
        B: HttpBody + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let ctx = RequestContext::attach(req.headers_mut(), remote_addr);
        let path = req.uri().path().to_string();
        let span = info_span!(
            "request",
            request_id = %ctx.id,
            method = %req.method(),
            path = %path,
        );

        async {
            match self.route(&path) {
                Some(handler) => handler.handle(req, &ctx).await,
                None => {
                    HandlerError::new(StatusCode::NOT_FOUND, format!("no handler for {}", path))
                        .to_response()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Waits for open websocket sessions to finish, up to `limit`.
    pub async fn wait_sessions(&self, limit: Duration) {
        for handler in self.bindings.values() {
            if let Handler::WebSocket(h) = handler {
                h.wait_sessions(limit).await;
            }
        }
    }
}
