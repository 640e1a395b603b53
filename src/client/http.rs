use std::future::Future;

use chrono::Utc;
use tokio::time::{Instant, interval_at};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::ClientError;
use crate::config::ClientOptions;
use crate::request_id::REQUEST_ID_HEADER;

/// Plain HTTP request loop: one request up front, then one per interval
/// until interrupted.
pub struct ContinuousRequestClient {
    options: ClientOptions,
    http: reqwest::Client,
    url: String,
}

impl ContinuousRequestClient {
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(options.timeout).build()?;
        let url = options.http_url();
        Ok(Self { options, http, url })
    }

    /// Returns the number of requests issued. Fails only when
    /// `exit_on_error` is set and a request fails.
    pub async fn run<F: Future>(&self, interrupt: F) -> Result<usize, ClientError> {
        let mut sent = 0;
        self.attempt(&mut sent).await?;

        let Some(period) = self.options.interval() else {
            return Ok(sent);
        };
        let mut ticker = interval_at(Instant::now() + period, period);
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.attempt(&mut sent).await?,
                _ = &mut interrupt => {
                    info!("interrupt");
                    return Ok(sent);
                }
            }
        }
    }

    async fn attempt(&self, sent: &mut usize) -> Result<(), ClientError> {
        *sent += 1;
        match self.send_once().await {
            Ok(_) => Ok(()),
            Err(e) if self.options.exit_on_error => Err(e),
            Err(ClientError::Status(status)) => {
                warn!(%status, "non-2xx response");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "request failed");
                Ok(())
            }
        }
    }

    /// Sends one request and prints the response body. A non-2xx status is
    /// reported as [`ClientError::Status`] after the body is printed.
    pub async fn send_once(&self) -> Result<String, ClientError> {
        let id = self.options.request_id();
        let payload = self.options.payload(Utc::now());
        let span = info_span!("call", request_id = %id);

        async {
            debug!(url = %self.url, verb = %self.options.verb, "sending request");
            let response = self
                .http
                .request(self.options.verb.clone(), &self.url)
                .header(REQUEST_ID_HEADER, &id)
                .body(payload)
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            println!("{}", body);

            if !status.is_success() {
                return Err(ClientError::Status(status));
            }
            Ok(body)
        }
        .instrument(span)
        .await
    }
}
