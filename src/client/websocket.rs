use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hyper::header::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, Span, debug, error, info, info_span};

use super::ClientError;
use crate::config::ClientOptions;
use crate::headers::Headers;
use crate::request_id::REQUEST_ID_HEADER;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the server's close reply after sending ours.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub writes: usize,
    pub received: usize,
}

/// One websocket connection for the whole run: a timestamp written per
/// interval, everything received logged by a background reader.
pub struct PersistentSocketClient {
    options: ClientOptions,
}

impl PersistentSocketClient {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    pub async fn run<F: Future>(&self, interrupt: F) -> Result<SessionSummary, ClientError> {
        let url = self.options.websocket_url();
        let id = self.options.request_id();
        let span = info_span!("socket", request_id = %id, url = %url);

        async {
            let socket = self.connect(&url, &id).await?;
            self.session(socket, interrupt).await
        }
        .instrument(span)
        .await
    }

    /// Drives an open connection: one write straight away, then one per
    /// interval until the reader ends or `interrupt` fires.
    async fn session<S, F>(
        &self,
        socket: WebSocketStream<S>,
        interrupt: F,
    ) -> Result<SessionSummary, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future,
    {
        let (mut sink, stream) = socket.split();

        let received = Arc::new(AtomicUsize::new(0));
        let mut reader = spawn_reader(stream, received.clone());
        let mut writes = 0;

        if !reader.is_finished() {
            self.write(&mut sink, &mut writes).await?;
        }

        let period = self.options.websocket_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                _ = &mut reader => {
                    debug!("reader finished");
                    break;
                }
                _ = ticker.tick() => self.write(&mut sink, &mut writes).await?,
                _ = &mut interrupt => {
                    info!("interrupt");
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        error!(error = %e, "error closing the connection");
                        break;
                    }
                    if tokio::time::timeout(CLOSE_WAIT, &mut reader).await.is_err() {
                        debug!("server did not close within the wait");
                    }
                    break;
                }
            }
        }
        reader.abort();

        Ok(SessionSummary {
            writes,
            received: received.load(Ordering::Relaxed),
        })
    }

    async fn connect(&self, url: &str, id: &str) -> Result<Socket, ClientError> {
        info!("connecting to url");
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_str(id)?);

        let connect = connect_async(request);
        let (socket, response) = tokio::time::timeout(self.options.timeout, connect)
            .await
            .map_err(|_| ClientError::ConnectTimeout(url.to_string()))?
            .map_err(|source| ClientError::Connect {
                url: url.to_string(),
                source,
            })?;
        debug!(
            status = %response.status(),
            headers = %Headers::from(response.headers()),
            "connected"
        );
        Ok(socket)
    }

    async fn write<S>(
        &self,
        sink: &mut SplitSink<WebSocketStream<S>, Message>,
        writes: &mut usize,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let payload = self.options.payload(Utc::now());
        match sink.send(Message::Text(payload)).await {
            Ok(()) => {
                *writes += 1;
                Ok(())
            }
            Err(e) if self.options.exit_on_error => Err(e.into()),
            Err(e) => {
                error!(error = %e, "write error");
                Ok(())
            }
        }
    }
}

/// Logs every inbound message; finishes when the connection ends.
fn spawn_reader<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    received: Arc<AtomicUsize>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Close(frame)) => {
                        info!(frame = ?frame, "server closed the connection");
                    }
                    Ok(message) if message.is_text() || message.is_binary() => {
                        received.fetch_add(1, Ordering::Relaxed);
                        info!(message = %message, "received message");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "read error");
                        return;
                    }
                }
            }
        }
        .instrument(Span::current()),
    )
}
