use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::ServerOptions;
use crate::handlers::HandlerRegistry;
use crate::shutdown::{Phase, ShutdownCoordinator, TerminationSignal};
use crate::snapshot::ServerSnapshot;

/// How long in-flight connections may take to finish once the listener
/// has stopped accepting.
pub const CONNECTION_DRAIN_LIMIT: Duration = Duration::from_secs(30);

pub struct HttpServer {
    listener: TcpListener,
    registry: Arc<HandlerRegistry>,
    close_conn_rx: oneshot::Receiver<()>,
}

impl HttpServer {
    pub async fn serve(
        addr: SocketAddr,
        registry: Arc<HandlerRegistry>,
    ) -> Result<(Self, oneshot::Sender<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("unable to bind {}", addr))?;
        let (tx, rx) = oneshot::channel::<()>();
        Ok((
            Self {
                listener,
                registry,
                close_conn_rx: rx,
            },
            tx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until the close channel fires, then waits for in-flight
    /// connections and websocket sessions to finish.
    pub async fn listen(mut self) -> Result<()> {
        let graceful = GracefulShutdown::new();
        let builder = auto::Builder::new(TokioExecutor::new());

        loop {
            tokio::select! {
                _ = &mut self.close_conn_rx => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((conn, addr)) => {
                            Self::handle_connection(&self.registry, &builder, &graceful, conn, addr)
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            };
        }
        drop(self.listener);

        info!("gracefully shutting down server, no longer accepting connections");
        tokio::select! {
            _ = graceful.shutdown() => info!("all connections drained"),
            _ = tokio::time::sleep(CONNECTION_DRAIN_LIMIT) => {
                warn!(
                    limit = ?CONNECTION_DRAIN_LIMIT,
                    "timed out waiting for connections to drain"
                );
            }
        }
        self.registry.wait_sessions(CONNECTION_DRAIN_LIMIT).await;
        Ok(())
    }

    fn handle_connection(
        registry: &Arc<HandlerRegistry>,
        builder: &auto::Builder<TokioExecutor>,
        graceful: &GracefulShutdown,
        conn: TcpStream,
        addr: SocketAddr,
    ) {
        debug!(%addr, "accepted connection");
        let registry = registry.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let registry = registry.clone();
            async move { Ok::<_, Infallible>(registry.dispatch(req, addr).await) }
        });

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(conn), service);
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%addr, error = %e, "connection error");
            }
            debug!(%addr, "terminating connection");
        });
    }
}

/// The listener, its handlers and the coordinator that drains them.
pub struct Server {
    http: HttpServer,
    close_tx: oneshot::Sender<()>,
    coordinator: ShutdownCoordinator,
    local_addr: SocketAddr,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        options: &ServerOptions,
        snapshot: ServerSnapshot,
    ) -> Result<Self> {
        let registry = Arc::new(HandlerRegistry::standard(&snapshot, options)?);
        info!(paths = ?registry.paths().collect::<Vec<_>>(), "handlers registered");
        let (http, close_tx) = HttpServer::serve(addr, registry.clone()).await?;
        let local_addr = http.local_addr()?;
        Ok(Self {
            http,
            close_tx,
            coordinator: ShutdownCoordinator::new(registry, options.shutdown_delay),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.coordinator.subscribe()
    }

    /// Serves until `signal` resolves, then runs the drain sequence.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future,
        F::Output: fmt::Debug,
    {
        info!(addr = %self.local_addr, "starting server");
        let handle = tokio::spawn(self.http.listen());

        self.coordinator.drain(signal).await;

        info!("commencing graceful shutdown of web server");
        self.close_tx.send(()).ok();
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("server task panicked: {}", e)),
        };
        self.coordinator.finish();
        result
    }
}

pub async fn run(options: ServerOptions) -> Result<()> {
    info!(options = ?options, "run called");
    let snapshot = ServerSnapshot::capture()?;
    info!(hostname = %snapshot.hostname(), started = %snapshot.started(), "captured server info");
    let mut signals = TerminationSignal::register().context("unable to register signal handlers")?;
    let server = Server::bind(options.listen_addr(), &options, snapshot).await?;
    server.run(signals.recv()).await
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::handlers::websocket::SHUTDOWN_REASON;
    use crate::request_id::REQUEST_ID_HEADER;
    use chrono::Utc;
    use futures_util::{SinkExt, StreamExt};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;

    pub(crate) struct TestServer {
        pub addr: SocketAddr,
        pub trigger: oneshot::Sender<()>,
        pub phases: watch::Receiver<Phase>,
        pub handle: JoinHandle<Result<()>>,
    }

    pub(crate) async fn spawn_server(shutdown_delay: Duration) -> TestServer {
        let options = ServerOptions {
            listen_port: 0,
            shutdown_delay,
        };
        let snapshot = ServerSnapshot::new("test-host", Utc::now());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(addr, &options, snapshot).await.unwrap();
        let (trigger, rx) = oneshot::channel::<()>();
        let addr = server.local_addr();
        let phases = server.phases();
        let handle = tokio::spawn(server.run(rx));
        TestServer {
            addr,
            trigger,
            phases,
            handle,
        }
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn serves_echo_and_health() {
        let server = spawn_server(Duration::from_millis(100)).await;
        let base = format!("http://{}", server.addr);

        let response = http()
            .post(format!("{}/post?a=b", base))
            .header(REQUEST_ID_HEADER, "abc123")
            .body("ping")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["id"], "abc123");
        assert_eq!(json["server"]["hostname"], "test-host");
        assert_eq!(json["request"]["path"], "/post");
        assert_eq!(json["request"]["query"], "a=b");
        assert_eq!(json["request"]["body"], "ping");
        assert_eq!(json["request"]["method"], "POST");

        let response = http().get(format!("{}/healthcheck", base)).send().await.unwrap();
        assert_eq!(response.status(), 200);

        server.trigger.send(()).unwrap();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drains_in_order() {
        let delay = Duration::from_millis(700);
        let mut server = spawn_server(delay).await;
        let base = format!("http://{}", server.addr);
        assert_eq!(*server.phases.borrow(), Phase::Running);

        let signaled = tokio::time::Instant::now();
        server.trigger.send(()).unwrap();
        server
            .phases
            .wait_for(|p| *p == Phase::Delaying)
            .await
            .unwrap();

        // new connections are still served during the delay, but report unhealthy
        let response = http().get(format!("{}/healthcheck", base)).send().await.unwrap();
        assert_eq!(response.status(), 500);
        let body = response.text().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["healthy"], true);

        let response = http().get(format!("{}/", base)).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["server"]["stopping"], true);

        server.handle.await.unwrap().unwrap();
        assert!(signaled.elapsed() >= delay);
        assert_eq!(*server.phases.borrow(), Phase::Stopped);

        assert!(TcpStream::connect(server.addr).await.is_err());
    }

    #[tokio::test]
    async fn websocket_echo_then_shutdown_close() {
        let server = spawn_server(Duration::from_millis(1500)).await;
        let url = format!("ws://{}/echo", server.addr);
        let (mut ws, response) = tokio_tungstenite::connect_async(url).await.unwrap();
        assert_eq!(response.status(), 101);

        ws.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(ws.next().await.unwrap().unwrap(), Message::Text("hello".into()));
        ws.send(Message::Binary(vec![9, 8, 7])).await.unwrap();
        assert_eq!(ws.next().await.unwrap().unwrap(), Message::Binary(vec![9, 8, 7]));

        server.trigger.send(()).unwrap();

        let mut closes = 0;
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(Some(frame)) = message {
                assert_eq!(frame.reason, SHUTDOWN_REASON);
                closes += 1;
            }
        }
        assert_eq!(closes, 1);

        server.handle.await.unwrap().unwrap();
    }
}
