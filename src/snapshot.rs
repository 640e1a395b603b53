use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Server identity plus the process-wide stopping flag.
///
/// Clones share the same flag: once any clone is marked stopping, every
/// other clone observes it. The flag never resets.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    hostname: Arc<str>,
    started: DateTime<Utc>,
    stopping: CancellationToken,
}

/// The serialized view embedded in response bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub started: DateTime<Utc>,
    pub stopping: bool,
}

impl ServerSnapshot {
    pub fn new(hostname: &str, started: DateTime<Utc>) -> Self {
        Self {
            hostname: Arc::from(hostname),
            started,
            stopping: CancellationToken::new(),
        }
    }

    /// Resolves the local hostname and stamps the start time.
    pub fn capture() -> Result<Self> {
        let hostname = resolve_hostname().context("unable to resolve hostname")?;
        Ok(Self::new(&hostname, Utc::now()))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    pub fn mark_stopping(&self) {
        self.stopping.cancel();
    }

    /// Completes once the flag has been set.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stopping.cancelled()
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            hostname: self.hostname.to_string(),
            started: self.started,
            stopping: self.is_stopping(),
        }
    }
}

#[cfg(unix)]
fn resolve_hostname() -> Result<String> {
    let name = nix::unistd::gethostname()?;
    name.into_string()
        .map_err(|raw| anyhow::anyhow!("hostname is not valid utf-8: {:?}", raw))
}

#[cfg(not(unix))]
fn resolve_hostname() -> Result<String> {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .context("neither HOSTNAME nor COMPUTERNAME is set")
}
