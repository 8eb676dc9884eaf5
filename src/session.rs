//! One forwarding session: a client stream paired with a freshly dialed
//! upstream, relayed until either direction ends.

use crate::{
    config::Config,
    dialer::Dialer,
    error::Error,
    pipe::Pipe,
    shutdown::Shutdown,
    stream::ClientStream,
};
use tokio::{
    io::{self, AsyncWrite, AsyncWriteExt},
    sync::broadcast,
    time::Instant,
};
use tracing::{debug, error, warn};

/// Per-session state, created by a worker for each dequeued client.
///
/// The session owns both streams from the moment they exist until both are
/// closed, exactly once each. The two copy directions run as sibling pipe
/// tasks; whichever terminates first decides the session's outcome, and the
/// other is then cut off, drained, and its halves reclaimed. First-terminus
/// teardown is deliberate: a byte-transparent relay has no framing to
/// consult, so "either direction ended" is the only definition of a finished
/// session.
pub(crate) struct Session<'a> {
    pub(crate) dialer: &'a Dialer,
    pub(crate) config: &'a Config,
    pub(crate) shutdown: &'a mut Shutdown,
}

impl Session<'_> {
    /// Relay `client` to a freshly dialed upstream until the first terminus.
    ///
    /// Returns only after both pipes have reported and both streams are
    /// closed.
    pub(crate) async fn run(self, client: ClientStream) {
        let mut client = client;

        let upstream = match self.dialer.open_upstream(self.shutdown).await {
            Ok(upstream) => upstream,
            Err(Error::Cancelled) => {
                debug!("session cancelled before an upstream was connected");
                close(&mut client, "client").await;
                return;
            }
            Err(err) => {
                error!(cause = %err, "failed to open upstream");
                close(&mut client, "client").await;
                return;
            }
        };

        // One absolute cutoff shared by both directions of both streams;
        // a quiescent session cannot outlive it.
        let deadline = Instant::now() + self.config.pipe_deadline;

        let (client_read, client_write) = io::split(client);
        let (upstream_read, upstream_write) = io::split(upstream);

        let (teardown, _) = broadcast::channel(1);
        let mut inbound = Pipe::spawn(
            client_read,
            upstream_write,
            deadline,
            Shutdown::new(teardown.subscribe()),
        );
        let mut outbound = Pipe::spawn(
            upstream_read,
            client_write,
            deadline,
            Shutdown::new(teardown.subscribe()),
        );

        let first = tokio::select! {
            outcome = inbound.recv() => outcome,
            outcome = outbound.recv() => outcome,
            _ = self.shutdown.recv() => None,
        };
        if let Some(Err(err)) = &first {
            error!(cause = %err, addr = %self.config.dial_addr, "pipe failed");
        }

        // Dropping the teardown sender unblocks whichever direction is
        // still copying; both results must then be consumed so no pipe
        // task is abandoned.
        drop(teardown);
        let inbound_halves = inbound.finish().await;
        let outbound_halves = outbound.finish().await;

        match (inbound_halves, outbound_halves) {
            (Some((client_read, upstream_write)), Some((upstream_read, client_write))) => {
                let mut client = client_read.unsplit(client_write);
                let mut upstream = upstream_read.unsplit(upstream_write);
                close(&mut client, "client").await;
                close(&mut upstream, "upstream").await;
            }
            // A pipe task can only fail to hand its halves back if it
            // panicked, and then they were already dropped and closed.
            _ => debug!("stream halves were reclaimed by task teardown"),
        }
    }
}

async fn close<S>(stream: &mut S, name: &'static str)
where
    S: AsyncWrite + Unpin,
{
    if let Err(err) = stream.shutdown().await {
        warn!(cause = %err, stream = name, "failed to close stream");
    }
}
