//! loqu - diagnostic server and client for exercising connection lifecycles
//!
//! ```bash
//! loqu serve --port 8080 --shutdown-delay 15
//! loqu call --port 8080 --interval 1
//! loqu call --port 8080 --ws --data hello
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod handlers;
mod headers;
mod request;
mod request_id;
mod response;
mod server;
mod shutdown;
mod snapshot;

use crate::config::{
    ClientOptions, DEFAULT_LISTEN_PORT, DEFAULT_SHUTDOWN_DELAY_SECS, Protocol, ServerOptions,
    parse_verb,
};

#[derive(Parser, Debug)]
#[command(name = "loqu")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "LOQU_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo server
    Serve(ServeArgs),
    /// Send requests to a loqu server
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_LISTEN_PORT, env = "LOQU_LISTEN_PORT")]
    port: u16,

    /// Seconds to keep serving after a termination signal
    #[arg(short, long, default_value_t = DEFAULT_SHUTDOWN_DELAY_SECS, env = "LOQU_SHUTDOWN_DELAY")]
    shutdown_delay: u64,
}

#[derive(Args, Debug)]
struct CallArgs {
    #[arg(short = 'H', long, default_value = "localhost", env = "LOQU_HOST")]
    host: String,

    #[arg(short, long, default_value_t = 80, env = "LOQU_PORT")]
    port: u16,

    /// Hold one websocket open instead of issuing HTTP requests
    #[arg(long, env = "LOQU_WS")]
    ws: bool,

    /// Seconds between requests; zero or less sends a single request
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true, env = "LOQU_INTERVAL")]
    interval: i64,

    /// Request and connect timeout in seconds
    #[arg(short, long, default_value_t = 5, env = "LOQU_TIMEOUT")]
    timeout: u64,

    /// Payload to send; defaults to the current time
    #[arg(short, long, env = "LOQU_DATA")]
    data: Option<String>,

    /// Request path; defaults to /post, or /echo with --ws
    #[arg(long, env = "LOQU_PATH")]
    path: Option<String>,

    /// Stop at the first failed request
    #[arg(short, long, env = "LOQU_EXIT")]
    exit: bool,

    #[arg(long, value_enum, default_value_t = Protocol::Http, env = "LOQU_PROTO")]
    proto: Protocol,

    /// Correlation id sent as x-request-id; generated when absent
    #[arg(long, env = "LOQU_ID")]
    id: Option<String>,

    #[arg(long, default_value = "POST", env = "LOQU_VERB")]
    verb: String,
}

impl CallArgs {
    fn into_options(self) -> Result<ClientOptions> {
        Ok(ClientOptions {
            host: self.host,
            port: self.port,
            protocol: self.proto,
            path: self.path,
            verb: parse_verb(&self.verb)?,
            request_id: self.id,
            timeout: Duration::from_secs(self.timeout),
            interval_seconds: self.interval,
            use_websocket: self.ws,
            payload: self.data,
            exit_on_error: self.exit,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Serve(args) => {
            let options = ServerOptions {
                listen_port: args.port,
                shutdown_delay: Duration::from_secs(args.shutdown_delay),
            };
            server::run(options).await
        }
        Command::Call(args) => client::run(args.into_options()?).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod test {
    use super::*;
    use hyper::Method;

    #[test]
    fn call_defaults() {
        let cli = Cli::parse_from(["loqu", "call"]);
        let Command::Call(args) = cli.command else {
            panic!("expected call");
        };
        let options = args.into_options().unwrap();
        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, 80);
        assert_eq!(options.verb, Method::POST);
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.http_url(), "http://localhost:80/post");
    }

    #[test]
    fn call_accepts_negative_interval() {
        let cli = Cli::parse_from(["loqu", "call", "-i", "-3", "--ws", "--proto", "wss"]);
        let Command::Call(args) = cli.command else {
            panic!("expected call");
        };
        let options = args.into_options().unwrap();
        assert_eq!(options.interval(), None);
        assert_eq!(options.websocket_url(), "wss://localhost:80/echo");
    }

    #[test]
    fn invalid_verb_is_rejected_before_running() {
        let cli = Cli::parse_from(["loqu", "call", "--verb", "NOT A VERB"]);
        let Command::Call(args) = cli.command else {
            panic!("expected call");
        };
        assert!(args.into_options().is_err());
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::parse_from(["loqu", "serve", "-s", "3"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 80);
        assert_eq!(args.shutdown_delay, 3);
    }
}
