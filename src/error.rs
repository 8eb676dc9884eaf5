use crate::config::Network;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown network `{0}`, expected tcp, udp or unix")]
    InvalidNetwork(String),
    #[error("network `{0}` is not supported")]
    UnsupportedNetwork(Network),
    #[error("no tls server name can be derived from addr: {0}")]
    InvalidServerName(String),
    /// Every dial attempt against the upstream failed and the backoff
    /// schedule ran out.
    #[error("dial retries exhausted, addr: {0}")]
    DialGiveUp(String),
    #[error("operation aborted by shutdown")]
    Cancelled,
}
