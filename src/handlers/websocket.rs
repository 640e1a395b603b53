use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hyper::body::Body as HttpBody;
use hyper::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Level, Span, debug, error, info, trace, warn};

use super::HandlerError;
use crate::request::RequestEnvelope;
use crate::request_id::RequestContext;
use crate::response::{Body, EchoResponse, HttpResponse, encode};
use crate::snapshot::ServerSnapshot;

pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Validates the opening handshake and builds the switching-protocols
/// response. Holds no per-connection state, so one instance serves every
/// connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Upgrader {
    config: WebSocketConfig,
}

impl Upgrader {
    pub fn upgrade<B>(
        &self,
        req: &mut Request<B>,
    ) -> Result<(Response<Body>, OnUpgrade), HandlerError> {
        if req.method() != Method::GET {
            return Err(HandlerError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "websocket: request method is not GET",
            ));
        }
        let headers = req.headers();
        if !has_token(headers, CONNECTION, "upgrade") {
            return Err(HandlerError::new(
                StatusCode::BAD_REQUEST,
                "websocket: 'upgrade' token not found in 'Connection' header",
            ));
        }
        if !has_token(headers, UPGRADE, "websocket") {
            return Err(HandlerError::new(
                StatusCode::BAD_REQUEST,
                "websocket: 'websocket' token not found in 'Upgrade' header",
            ));
        }
        if !has_token(headers, SEC_WEBSOCKET_VERSION, "13") {
            return Err(HandlerError::new(
                StatusCode::BAD_REQUEST,
                "websocket: unsupported version: 13 not found in 'Sec-Websocket-Version' header",
            ));
        }
        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                HandlerError::new(
                    StatusCode::BAD_REQUEST,
                    "websocket: not a websocket handshake: 'Sec-WebSocket-Key' header is missing",
                )
            })?;
        let accept = derive_accept_key(key.as_bytes());
        let accept = HeaderValue::from_str(&accept)
            .map_err(|e| HandlerError::internal(format!("websocket: bad accept key: {}", e)))?;

        let on_upgrade = hyper::upgrade::on(req);
        let response = HttpResponse::new()
            .with_status(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(CONNECTION, HeaderValue::from_static("Upgrade"))
            .with_header(SEC_WEBSOCKET_ACCEPT, accept)
            .build();
        Ok((response, on_upgrade))
    }
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

pub fn message_type(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "Text",
        Message::Binary(_) => "Binary",
        Message::Close(_) => "Close",
        Message::Ping(_) => "Ping",
        Message::Pong(_) => "Pong",
        Message::Frame(_) => "Frame",
    }
}

/// Echoes websocket frames back to the sender. Once the server starts
/// stopping, every open session is sent a close frame and released.
#[derive(Debug)]
pub struct WebSocketEcho {
    snapshot: ServerSnapshot,
    grace: Duration,
    upgrader: Option<Upgrader>,
    sessions: TaskTracker,
}

impl WebSocketEcho {
    pub fn new(snapshot: ServerSnapshot, grace: Duration) -> Self {
        Self {
            snapshot,
            grace,
            upgrader: None,
            sessions: TaskTracker::new(),
        }
    }

    pub fn start(&mut self) {
        self.upgrader = Some(Upgrader::default());
    }

    pub fn is_started(&self) -> bool {
        self.upgrader.is_some()
    }

    pub fn stop(&self) {
        info!(
            sessions = self.sessions.len(),
            "shutdown signal received, websocket sessions will now drain"
        );
        self.snapshot.mark_stopping();
    }

    pub async fn handle<B>(
        &self,
        mut req: Request<B>,
        ctx: &RequestContext,
    ) -> Result<Response<Body>, HandlerError>
    where
        B: HttpBody,
    {
        let upgrader = self.upgrader.ok_or_else(|| {
            HandlerError::new(StatusCode::SERVICE_UNAVAILABLE, "handler not started")
        })?;

        let envelope = RequestEnvelope::from_head(&req, ctx, String::new());
        let (response, on_upgrade) = upgrader.upgrade(&mut req).map_err(|e| {
            error!(error = %e.message, "websocket upgrade failed");
            e
        })?;

        let session = EchoSession {
            snapshot: self.snapshot.clone(),
            grace: self.grace,
            envelope,
        };
        let config = upgrader.config;
        self.sessions.spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let ws = WebSocketStream::from_raw_socket(
                            TokioIo::new(upgraded),
                            Role::Server,
                            Some(config),
                        )
                        .await;
                        session.run(ws).await;
                    }
                    Err(e) => error!(error = %e, "websocket upgrade failed"),
                }
            }
            .instrument(Span::current()),
        );

        Ok(response)
    }

    pub async fn wait_sessions(&self, limit: Duration) {
        self.sessions.close();
        if tokio::time::timeout(limit, self.sessions.wait()).await.is_err() {
            warn!(
                remaining = self.sessions.len(),
                "websocket sessions still open after drain limit"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    ReadFailed,
    WriteFailed,
    Drained { acknowledged: bool },
}

#[derive(Serialize)]
struct EchoLog<'a> {
    message: Cow<'a, str>,
    #[serde(rename = "messageType")]
    message_type: &'static str,
    info: EchoResponse,
}

/// One upgraded connection, driven by a single task from open to release.
pub struct EchoSession {
    pub snapshot: ServerSnapshot,
    pub grace: Duration,
    pub envelope: RequestEnvelope,
}

impl EchoSession {
    pub async fn run<S>(self, mut ws: WebSocketStream<S>) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("websocket session open");
        let end = loop {
            if self.snapshot.is_stopping() {
                break self.drain(&mut ws).await;
            }

            let next = tokio::select! {
                biased;
                _ = self.snapshot.stopped() => continue,
                next = ws.next() => next,
            };

            match next {
                None => {
                    debug!("connection closed by peer");
                    break SessionEnd::PeerClosed;
                }
                Some(Err(e)) => {
                    error!(error = %e, "read failed");
                    break SessionEnd::ReadFailed;
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    error!(code = ?code, "connection closed");
                    // flushes the queued close reply
                    let _ = ws.flush().await;
                    break SessionEnd::PeerClosed;
                }
                Some(Ok(message)) if message.is_text() || message.is_binary() => {
                    self.log_echo(&message);
                    if let Err(e) = ws.send(message).await {
                        error!(error = %e, "write failed");
                        break SessionEnd::WriteFailed;
                    }
                }
                Some(Ok(message)) => {
                    trace!(message_type = message_type(&message), "control frame");
                }
            }
        };
        debug!(end = ?end, "websocket session released");
        end
    }

    /// Sends the shutdown close frame, then waits for the peer's close reply
    /// or the grace period, whichever comes first.
    async fn drain<S>(&self, ws: &mut WebSocketStream<S>) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(grace = ?self.grace, "server shutting down, closing websocket");
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed(SHUTDOWN_REASON),
        };
        if let Err(e) = ws.send(Message::Close(Some(frame))).await {
            error!(error = %e, "unable to send close frame");
            return SessionEnd::WriteFailed;
        }

        let acknowledged = tokio::time::timeout(self.grace, async {
            while let Some(next) = ws.next().await {
                match next {
                    Ok(Message::Close(_)) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        SessionEnd::Drained { acknowledged }
    }

    fn log_echo(&self, message: &Message) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let text = match message {
            Message::Text(text) => Cow::Borrowed(text.as_str()),
            Message::Binary(data) => String::from_utf8_lossy(data),
            _ => Cow::Borrowed(""),
        };
        let record = EchoLog {
            message: text,
            message_type: message_type(message),
            info: EchoResponse::build(self.envelope.clone(), &self.snapshot),
        };
        if let Ok(json) = encode(&record, false) {
            debug!(echo = %String::from_utf8_lossy(&json), "echo received");
        }
    }
}
