//! A byte-transparent stream relay.
//!
//! Inbound connections on a configured listening endpoint are forwarded,
//! unmodified, to a fixed upstream endpoint, optionally over TLS. The
//! engine bounds concurrency with a fixed worker pool and a bounded accept
//! queue, enforces a wall-clock deadline on every session, retries the
//! upstream dial with quadratic backoff, and shuts down cooperatively.
//!
//! [`server::run`] is the entry point; everything else hangs off the
//! [`Config`] it consumes.

pub mod config;
pub mod error;
pub mod server;
pub mod stream;

mod dialer;
mod pipe;
mod session;
mod shutdown;

pub use config::{Config, Network};
pub use error::Error;
pub use stream::Listener;

/// Address the relay listens on when none is given.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5444";

pub type Result<T> = std::result::Result<T, Error>;
