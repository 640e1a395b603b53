use hyper::body::Body as HttpBody;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error, info};

use super::{HandlerError, json_response};
use crate::request::RequestEnvelope;
use crate::request_id::RequestContext;
use crate::response::{Body, EchoResponse, HealthResponse};
use crate::snapshot::ServerSnapshot;

/// Readiness probe. The status code is what load balancers act on: 200
/// while running, 500 once stopping. The body still says `healthy: true`.
#[derive(Debug)]
pub struct HealthCheck {
    snapshot: ServerSnapshot,
    started: bool,
}

impl HealthCheck {
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
        info!("shutdown signal received, health checks will now begin returning error codes");
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
        debug!("handling health check");

        let envelope = RequestEnvelope::capture(req, ctx).await.map_err(|e| {
            error!(error = %e, "unable to read request body");
            HandlerError::internal("unable to read request body")
        })?;
        let record = HealthResponse {
            healthy: true,
            info: EchoResponse::build(envelope, &self.snapshot),
        };

        let status = if record.info.server.stopping {
            info!("returning unhealthy because of shutdown signal");
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        json_response(status, &record)
    }
}
