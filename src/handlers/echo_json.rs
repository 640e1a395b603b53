use hyper::body::Body as HttpBody;
use hyper::{Request, Response, StatusCode};
use tracing::{Level, debug, error, info};

use super::{HandlerError, json_response};
use crate::request::RequestEnvelope;
use crate::request_id::RequestContext;
use crate::response::{Body, EchoResponse, encode};
use crate::snapshot::ServerSnapshot;

/// Answers every request with a JSON description of itself. Keeps serving
/// normally while the server drains.
#[derive(Debug)]
pub struct EchoJson {
    snapshot: ServerSnapshot,
    started: bool,
}

impl EchoJson {
    pub fn new(snapshot: ServerSnapshot) -> Self {
        Self {
            snapshot,
            started: false,
        }
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stop(&self) {
        info!("shutdown signal received, processing will continue normally");
        self.snapshot.mark_stopping();
    }

    pub async fn handle<B>(
        &self,
        req: Request<B>,
        ctx: &RequestContext,
    ) -> Result<Response<Body>, HandlerError>
    where
        B: HttpBody,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        info!("handling request");

        let envelope = RequestEnvelope::capture(req, ctx).await.map_err(|e| {
            error!(error = %e, "unable to read request body");
            HandlerError::internal("unable to read request body")
        })?;
        let record = EchoResponse::build(envelope, &self.snapshot);
        let response = json_response(StatusCode::OK, &record)?;

        if tracing::enabled!(Level::DEBUG) {
            if let Ok(compact) = encode(&record, false) {
                debug!(body = %String::from_utf8_lossy(&compact), "writing response");
            }
        }
        Ok(response)
    }
}
