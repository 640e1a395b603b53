use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use hyper::Method;

use crate::request_id::new_request_id;

pub const DEFAULT_LISTEN_PORT: u16 = 80;
pub const DEFAULT_SHUTDOWN_DELAY_SECS: u64 = 15;

/// Subtracted from the shutdown delay to get the websocket drain grace.
const GRACE_MARGIN: Duration = Duration::from_secs(1);
const MIN_SOCKET_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_port: u16,
    pub shutdown_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            shutdown_delay: Duration::from_secs(DEFAULT_SHUTDOWN_DELAY_SECS),
        }
    }
}

impl ServerOptions {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.listen_port))
    }

    pub fn websocket_grace(&self) -> Duration {
        self.shutdown_delay.saturating_sub(GRACE_MARGIN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
}

impl Protocol {
    /// The scheme to use for plain HTTP requests.
    pub fn http_scheme(self) -> &'static str {
        match self {
            Protocol::Http | Protocol::Ws => "http",
            Protocol::Https | Protocol::Wss => "https",
        }
    }

    /// The scheme to use when dialing a websocket.
    pub fn websocket_scheme(self) -> &'static str {
        match self {
            Protocol::Http | Protocol::Ws => "ws",
            Protocol::Https | Protocol::Wss => "wss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub path: Option<String>,
    pub verb: Method,
    pub request_id: Option<String>,
    pub timeout: Duration,
    pub interval_seconds: i64,
    pub use_websocket: bool,
    pub payload: Option<String>,
    pub exit_on_error: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_LISTEN_PORT,
            protocol: Protocol::Http,
            path: None,
            verb: Method::POST,
            request_id: None,
            timeout: Duration::from_secs(5),
            interval_seconds: 0,
            use_websocket: false,
            payload: None,
            exit_on_error: false,
        }
    }
}

impl ClientOptions {
    pub fn http_url(&self) -> String {
        self.url(self.protocol.http_scheme(), "/post")
    }

    pub fn websocket_url(&self) -> String {
        self.url(self.protocol.websocket_scheme(), "/echo")
    }

    fn url(&self, scheme: &str, default_path: &str) -> String {
        let path = self.path.as_deref().unwrap_or(default_path);
        let separator = if path.starts_with('/') { "" } else { "/" };
        format!("{}://{}:{}{}{}", scheme, self.host, self.port, separator, path)
    }

    /// `None` means a single request and no loop.
    pub fn interval(&self) -> Option<Duration> {
        u64::try_from(self.interval_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Websocket writes never go faster than once a second.
    pub fn websocket_interval(&self) -> Duration {
        self.interval()
            .map_or(MIN_SOCKET_INTERVAL, |i| i.max(MIN_SOCKET_INTERVAL))
    }

    /// The configured id, or a fresh one for every call.
    pub fn request_id(&self) -> String {
        match self.request_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => new_request_id(),
        }
    }

    pub fn payload(&self, now: DateTime<Utc>) -> String {
        self.payload.clone().unwrap_or_else(|| now.to_string())
    }
}

pub fn parse_verb(verb: &str) -> Result<Method> {
    Method::from_bytes(verb.to_uppercase().as_bytes())
        .with_context(|| format!("invalid http verb: {}", verb))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grace_is_delay_minus_margin() {
        let mut options = ServerOptions::default();
        assert_eq!(options.websocket_grace(), Duration::from_secs(14));
        options.shutdown_delay = Duration::from_millis(300);
        assert_eq!(options.websocket_grace(), Duration::ZERO);
    }

    #[test]
    fn listen_addr_binds_all_interfaces() {
        let options = ServerOptions {
            listen_port: 8080,
            ..Default::default()
        };
        assert_eq!(options.listen_addr().to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn urls_follow_mode_defaults() {
        let mut options = ClientOptions {
            host: "example.test".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(options.http_url(), "http://example.test:8080/post");
        assert_eq!(options.websocket_url(), "ws://example.test:8080/echo");

        options.protocol = Protocol::Https;
        options.path = Some("status".to_string());
        assert_eq!(options.http_url(), "https://example.test:8080/status");
        assert_eq!(options.websocket_url(), "wss://example.test:8080/status");

        options.protocol = Protocol::Ws;
        assert_eq!(options.http_url(), "http://example.test:8080/status");
    }

    #[test]
    fn non_positive_interval_is_single_shot() {
        for secs in [0, -1, -30] {
            let options = ClientOptions {
                interval_seconds: secs,
                ..Default::default()
            };
            assert_eq!(options.interval(), None);
        }
        let options = ClientOptions {
            interval_seconds: 3,
            ..Default::default()
        };
        assert_eq!(options.interval(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn websocket_interval_is_clamped_to_one_second() {
        for secs in [-5, 0, 1] {
            let options = ClientOptions {
                interval_seconds: secs,
                ..Default::default()
            };
            assert_eq!(options.websocket_interval(), Duration::from_secs(1));
        }
        let options = ClientOptions {
            interval_seconds: 4,
            ..Default::default()
        };
        assert_eq!(options.websocket_interval(), Duration::from_secs(4));
    }

    #[test]
    fn request_id_override_or_fresh() {
        let mut options = ClientOptions::default();
        let a = options.request_id();
        let b = options.request_id();
        assert_ne!(a, b);

        options.request_id = Some("abc123".to_string());
        assert_eq!(options.request_id(), "abc123");
    }

    #[test]
    fn payload_defaults_to_timestamp() {
        let now = Utc::now();
        let mut options = ClientOptions::default();
        assert_eq!(options.payload(now), now.to_string());
        options.payload = Some(String::new());
        assert_eq!(options.payload(now), "");
    }

    #[test]
    fn verbs() {
        assert_eq!(parse_verb("post").unwrap(), Method::POST);
        assert_eq!(parse_verb("PURGE").unwrap().as_str(), "PURGE");
        assert!(parse_verb("GE T").is_err());
    }
}
