use std::future::Future;

use anyhow::{Context, Result};
use tokio_tungstenite::tungstenite;
use tracing::info;

use crate::config::ClientOptions;

pub mod http;
pub mod websocket;

pub use http::ContinuousRequestClient;
pub use websocket::PersistentSocketClient;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("error sending http request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("invalid request id header: {0}")]
    InvalidHeader(#[from] hyper::header::InvalidHeaderValue),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Runs the configured client mode until it finishes or the process is
/// interrupted.
pub async fn run(options: ClientOptions) -> Result<()> {
    info!(options = ?options, "run called");
    let interrupt = interrupted().context("unable to listen for interrupt")?;
    if options.use_websocket {
        let summary = PersistentSocketClient::new(options).run(interrupt).await?;
        info!(writes = summary.writes, received = summary.received, "websocket session finished");
    } else {
        let sent = ContinuousRequestClient::new(options)?.run(interrupt).await?;
        info!(sent, "request loop finished");
    }
    Ok(())
}

/// Registers the SIGINT handler before anything is sent, so an interrupt
/// during the first request or the websocket dial is still cooperative.
#[cfg(unix)]
fn interrupted() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        interrupt.recv().await;
    })
}

#[cfg(windows)]
fn interrupted() -> std::io::Result<impl Future<Output = ()>> {
    let mut interrupt = tokio::signal::windows::ctrl_c()?;
    Ok(async move {
        interrupt.recv().await;
    })
}

#[cfg(all(test, unix))]
mod test {
    use super::*;
    use nix::sys::signal::{Signal, raise};
    use std::time::Duration;

    #[tokio::test]
    async fn interrupt_listener_is_armed_before_first_poll() {
        let interrupt = interrupted().unwrap();
        raise(Signal::SIGINT).unwrap();
        tokio::time::timeout(Duration::from_secs(2), interrupt)
            .await
            .expect("SIGINT raised before the first poll must still resolve");
    }
}
