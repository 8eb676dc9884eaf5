use anyhow::Context;
use clap::Parser;
use ponte::{server, Config, Listener, Network, DEFAULT_LISTEN_ADDR};
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = RelayArgs::parse();

    let default_filter = if args.debug { "ponte=debug" } else { "ponte=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config();
    let listener = Listener::bind(config.listen_network, &config.listen_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind {} listener on {}",
                config.listen_network, config.listen_addr
            )
        })?;
    info!(addr = %config.listen_addr, upstream = %config.dial_addr, "listening");

    server::run(listener, config, signal::ctrl_c()).await?;

    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "ponte", version, author)]
/// A byte-transparent relay fronting a fixed upstream endpoint.
struct RelayArgs {
    /// Listener transport family (tcp or unix; udp is rejected).
    #[arg(long, default_value = "tcp")]
    listen_network: Network,
    /// Listen address, `host:port` or a socket path.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: String,
    /// Upstream transport family.
    #[arg(long, default_value = "tcp")]
    dial_network: Network,
    /// Upstream address, `host:port` or a socket path.
    #[arg(long)]
    dial_addr: String,
    /// Budget for a single upstream dial attempt.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    dial_timeout: Duration,
    /// Wrap the upstream connection with TLS.
    #[arg(long)]
    dial_tls: bool,
    /// Skip upstream certificate verification.
    #[arg(long)]
    tls_skip_verify: bool,
    /// Base of the quadratic backoff between dial attempts.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    retry_time: Duration,
    /// Maximum dial attempts before a session is abandoned.
    #[arg(long, default_value_t = 5)]
    max_retry: u32,
    /// Wall-clock deadline for a whole forwarding session.
    #[arg(long, default_value = "120s", value_parser = humantime::parse_duration)]
    pipe_deadline: Duration,
    /// Send TCP keep-alive probes on client connections.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    keep_alive: bool,
    /// Interval between TCP keep-alive probes.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    keep_alive_period: Duration,
    /// Worker count, the cap on concurrently forwarded sessions.
    #[arg(long, default_value_t = 2)]
    max_server: usize,
    /// Capacity of the accepted-client queue.
    #[arg(long, default_value_t = 10)]
    max_client: usize,
    /// Report the accept-queue depth every second.
    #[arg(long)]
    debug: bool,
}

impl RelayArgs {
    fn into_config(self) -> Config {
        Config {
            listen_network: self.listen_network,
            listen_addr: self.listen_addr,
            dial_network: self.dial_network,
            dial_addr: self.dial_addr,
            dial_timeout: self.dial_timeout,
            pipe_deadline: self.pipe_deadline,
            retry_time: self.retry_time,
            max_retry: self.max_retry,
            keep_alive: self.keep_alive,
            keep_alive_period: self.keep_alive_period,
            dial_tls: self.dial_tls,
            tls_skip_verify: self.tls_skip_verify,
            max_server_connections: self.max_server,
            max_client_connections: self.max_client,
            debug: self.debug,
        }
    }
}
