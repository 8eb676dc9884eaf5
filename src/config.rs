//! Relay configuration, assembled by the binary and immutable afterwards.

use crate::Error;
use std::{fmt, str::FromStr, time::Duration};

/// Everything the engine needs to know, fixed for its whole lifetime.
///
/// The supervisor wraps this in an `Arc` and hands clones of the handle to
/// every worker, so no field requires synchronization.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport family of the listening endpoint.
    pub listen_network: Network,
    /// `host:port` for tcp, a filesystem path for unix.
    pub listen_addr: String,
    /// Transport family of the upstream endpoint.
    pub dial_network: Network,
    /// Upstream `host:port` or socket path.
    pub dial_addr: String,
    /// Budget for a single dial attempt, TLS handshake included.
    pub dial_timeout: Duration,
    /// Wall-clock deadline shared by both directions of a session.
    pub pipe_deadline: Duration,
    /// Base of the quadratic backoff between dial attempts.
    pub retry_time: Duration,
    /// Number of dial attempts before a session is abandoned.
    pub max_retry: u32,
    /// Whether accepted TCP clients get keep-alive probes.
    pub keep_alive: bool,
    /// Interval between keep-alive probes.
    pub keep_alive_period: Duration,
    /// Wrap the upstream leg with TLS.
    pub dial_tls: bool,
    /// Accept any certificate the upstream presents.
    pub tls_skip_verify: bool,
    /// Worker count; the cap on concurrently forwarded sessions.
    pub max_server_connections: usize,
    /// Capacity of the accepted-client queue.
    pub max_client_connections: usize,
    /// Report the queue depth once a second.
    pub debug: bool,
}

/// Transport family of a listen or dial endpoint.
///
/// `Udp` parses, so an operator gets a precise error at bind or dial time
/// rather than a flag-parsing one, but no datagram session model exists and
/// both endpoints reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
    Unix,
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            "unix" => Ok(Network::Unix),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}
