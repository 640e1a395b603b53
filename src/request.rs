use http_body_util::BodyExt;
use hyper::Request;
use hyper::body::Body;

use crate::headers::Headers;
use crate::request_id::RequestContext;

/// Everything captured from one inbound request. Lives only for the
/// duration of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub id: String,
    pub remote_address: String,
    pub path: String,
    pub query: String,
    pub method: String,
    pub headers: Headers,
    pub body: String,
}

impl RequestEnvelope {
    /// Describes the request head without consuming its body.
    pub fn from_head<B>(req: &Request<B>, ctx: &RequestContext, body: String) -> Self {
        Self {
            id: ctx.id.clone(),
            remote_address: ctx.remote_addr.to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or_default().to_string(),
            method: req.method().to_string(),
            headers: Headers::from(req.headers()),
            body,
        }
    }

    /// Reads the full body and captures the request.
    pub async fn capture<B>(req: Request<B>, ctx: &RequestContext) -> anyhow::Result<Self>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| {
                let source: Box<dyn std::error::Error + Send + Sync> = e.into();
                anyhow::anyhow!(source)
            })?
            .to_bytes();
        let head = Request::from_parts(parts, ());
        Ok(Self::from_head(
            &head,
            ctx,
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;

    fn ctx() -> RequestContext {
        RequestContext {
            id: "abc123".to_string(),
            remote_addr: "10.0.0.7:5555".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn captures_request_verbatim() {
        let req = Request::builder()
            .method("PUT")
            .uri("/coffee/pot?size=large&sugar")
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from_static(b"brew")))
            .unwrap();

        let envelope = RequestEnvelope::capture(req, &ctx()).await.unwrap();
        assert_eq!(envelope.id, "abc123");
        assert_eq!(envelope.remote_address, "10.0.0.7:5555");
        assert_eq!(envelope.path, "/coffee/pot");
        assert_eq!(envelope.query, "size=large&sugar");
        assert_eq!(envelope.method, "PUT");
        assert_eq!(envelope.body, "brew");
        assert_eq!(
            envelope.headers.get("content-type").unwrap(),
            &["text/plain".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_query_and_body() {
        let req = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let envelope = RequestEnvelope::capture(req, &ctx()).await.unwrap();
        assert_eq!(envelope.query, "");
        assert_eq!(envelope.body, "");
        assert_eq!(envelope.method, "GET");
    }
}
