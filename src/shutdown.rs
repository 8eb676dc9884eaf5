use tokio::sync::broadcast::Receiver;

/// Observer half of a cancellation signal.
///
/// The supervisor owns a `broadcast::Sender` and every long-lived task wraps
/// its own subscription in a `Shutdown`. The signal trips either when a value
/// is broadcast or when the sender is dropped; both unblock `recv()`. Each
/// session additionally owns a private sender whose subscribers are its two
/// pipes, so the same type serves both the root token and the per-session
/// teardown signal.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the signal has been observed.
    is_shutdown: bool,
    /// The subscription this observer waits on.
    notify: Receiver<()>,
}

impl Shutdown {
    /// Wraps a broadcast subscription in a `Shutdown` observer.
    pub(crate) fn new(notify: Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Whether the signal has already been observed by this handle.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for the signal, returning immediately if it was already seen.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // A lag error is impossible since at most one value is ever sent,
        // and a closed channel counts as the signal too.
        let _ = self.notify.recv().await;

        self.is_shutdown = true;
    }
}
