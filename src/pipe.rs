//! One-directional byte copy between the halves of two streams.

use crate::shutdown::Shutdown;
use bytes::BytesMut;
use std::io;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error};

/// Size of the relay buffer for a single direction.
const BUFFER_SIZE: usize = 16 * 1024;

/// A running copy task and the single-slot channel carrying its terminal
/// result.
///
/// Two of these run per session, one per direction. The task never closes or
/// shuts down either half it holds; when its copy loop ends it reports the
/// outcome and hands both halves back through the join handle, so the
/// session alone decides when the underlying streams are closed.
pub(crate) struct Pipe<R, W> {
    result: mpsc::Receiver<io::Result<u64>>,
    handle: JoinHandle<(R, W)>,
}

impl<R, W> Pipe<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the copy task for one direction.
    ///
    /// The copy runs until `src` reaches EOF, either side fails, `deadline`
    /// passes, or `teardown` fires. EOF and teardown are reported as
    /// `Ok(bytes_copied)`; the deadline surfaces as an
    /// [`io::ErrorKind::TimedOut`] error.
    pub(crate) fn spawn(mut src: R, mut dst: W, deadline: Instant, mut teardown: Shutdown) -> Self {
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let outcome = copy(&mut src, &mut dst, deadline, &mut teardown).await;
            // Single slot, and the session always drains it, so this cannot
            // block indefinitely.
            let _ = tx.send(outcome).await;
            (src, dst)
        });

        Pipe { result: rx, handle }
    }

    /// Wait for this direction's terminal result.
    pub(crate) async fn recv(&mut self) -> Option<io::Result<u64>> {
        self.result.recv().await
    }

    /// Consume any result still in flight, then recover the two halves.
    ///
    /// Late non-EOF results are teardown echoes of a copy the session has
    /// already cut off; they are demoted to debug logging and never change
    /// the session's recorded outcome. Returns `None` only if the copy task
    /// itself died, in which case its halves were dropped (and therefore
    /// closed) with it.
    pub(crate) async fn finish(mut self) -> Option<(R, W)> {
        while let Some(outcome) = self.result.recv().await {
            if let Err(err) = outcome {
                debug!(cause = %err, "pipe ended during teardown");
            }
        }

        match self.handle.await {
            Ok(halves) => Some(halves),
            Err(err) => {
                error!(cause = %err, "pipe task aborted");
                None
            }
        }
    }
}

async fn copy<R, W>(
    src: &mut R,
    dst: &mut W,
    deadline: Instant,
    teardown: &mut Shutdown,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
    let mut copied = 0u64;

    loop {
        buf.clear();

        let n = tokio::select! {
            read = src.read_buf(&mut buf) => read?,
            _ = time::sleep_until(deadline) => return Err(deadline_elapsed()),
            _ = teardown.recv() => return Ok(copied),
        };
        if n == 0 {
            return Ok(copied);
        }

        // The flush matters for the TLS upstream, which buffers records
        // internally; for plain sockets it is a no-op.
        tokio::select! {
            written = async {
                dst.write_all(&buf[..n]).await?;
                dst.flush().await
            } => written?,
            _ = time::sleep_until(deadline) => return Err(deadline_elapsed()),
            _ = teardown.recv() => return Ok(copied),
        }

        copied += n as u64;
    }
}

fn deadline_elapsed() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "pipe deadline elapsed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::sync::broadcast;
    use tokio::time::Duration;

    fn teardown_pair() -> (broadcast::Sender<()>, Shutdown) {
        let (tx, rx) = broadcast::channel(1);
        (tx, Shutdown::new(rx))
    }

    #[tokio::test]
    async fn copies_bytes_until_eof() {
        let (mut client, src) = duplex(64);
        let (dst, mut sink) = duplex(64);
        let (_teardown, shutdown) = teardown_pair();
        let mut pipe = Pipe::spawn(src, dst, Instant::now() + Duration::from_secs(5), shutdown);

        client.write_all(b"ping").await.unwrap();
        drop(client);

        let copied = pipe.recv().await.unwrap().unwrap();
        assert_eq!(copied, 4);

        let mut buf = [0u8; 4];
        sink.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(pipe.finish().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_an_idle_copy() {
        let (_client, src) = duplex(64);
        let (dst, _sink) = duplex(64);
        let (_teardown, shutdown) = teardown_pair();
        let mut pipe = Pipe::spawn(src, dst, Instant::now() + Duration::from_millis(50), shutdown);

        let err = pipe.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        assert!(pipe.finish().await.is_some());
    }

    #[tokio::test]
    async fn teardown_interrupts_a_blocked_copy() {
        let (_client, src) = duplex(64);
        let (dst, _sink) = duplex(64);
        let (teardown, shutdown) = teardown_pair();
        let mut pipe = Pipe::spawn(src, dst, Instant::now() + Duration::from_secs(5), shutdown);

        drop(teardown);

        let copied = pipe.recv().await.unwrap().unwrap();
        assert_eq!(copied, 0);

        assert!(pipe.finish().await.is_some());
    }
}
