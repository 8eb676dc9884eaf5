//! Relay engine: supervisor, acceptor and the dial-worker pool.
//!
//! Provides an async `run` function that accepts inbound connections and
//! feeds them through a bounded queue to a fixed pool of workers, each of
//! which forwards one session at a time.

use crate::{
    config::Config,
    dialer::Dialer,
    session::Session,
    shutdown::Shutdown,
    stream::{ClientStream, Listener},
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    time,
};
use tracing::{debug, error, info, warn};

/// Engine state. Created in the `run` call, which performs the accepting
/// and owns the whole task tree.
struct Supervisor {
    /// Listening socket supplied by the `run` caller, which also decides
    /// when binding failures are fatal.
    listener: Listener,
    /// Shared engine configuration.
    config: Arc<Config>,
    /// Upstream dial handle, cloned into every worker.
    dialer: Dialer,
    /// Broadcasts the shutdown signal to workers, sessions and the
    /// queue-depth reporter.
    ///
    /// `run` drops this sender once its shutdown future completes; every
    /// subscribed `Shutdown` observer then unblocks. Nothing is ever sent
    /// through it while the engine is running.
    notify_shutdown: broadcast::Sender<()>,
    /// Completion tracking for graceful shutdown.
    ///
    /// Every worker holds a clone. When the last clone is dropped the
    /// receiver side in `run` sees `None`, which means all workers have
    /// exited and every in-flight session has fully torn down.
    shutdown_complete_tx: mpsc::Sender<()>,
}

/// A long-lived worker that forwards one session at a time.
///
/// The pool size is the admission-control mechanism: a session only starts
/// when a worker is free, so the number of concurrently forwarded sessions
/// can never exceed the worker count.
struct DialWorker {
    /// Shared handle on the accepted-client queue. The mutex serializes
    /// dequeues; whichever worker holds it next gets the oldest client, so
    /// clients are serviced in accept order.
    queue: Arc<Mutex<mpsc::Receiver<ClientStream>>>,
    /// Upstream dial handle.
    dialer: Dialer,
    /// Shared engine configuration.
    config: Arc<Config>,
    /// Listens for the engine shutdown signal.
    shutdown: Shutdown,
    /// Dropped when the worker exits; lets the supervisor await drain.
    _shutdown_complete: mpsc::Sender<()>,
}

/// Run the relay engine.
///
/// Accepts connections from the supplied listener and forwards each through
/// a freshly dialed upstream. The engine runs until the `shutdown` future
/// completes, then tears down cooperatively: the listener closes, workers
/// finish or cut short their current session, and `run` returns only once
/// every task has drained.
///
/// `tokio::signal::ctrl_c()` is the natural `shutdown` argument for a
/// binary.
///
/// # Errors
///
/// Returns `Err` only for startup problems, such as an upstream TLS
/// configuration that cannot be built. Per-connection errors never bubble
/// up here.
pub async fn run(listener: Listener, config: Config, shutdown: impl Future) -> crate::Result<()> {
    let config = Arc::new(config);
    let dialer = Dialer::new(config.clone())?;

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let mut supervisor = Supervisor {
        listener,
        config,
        dialer,
        notify_shutdown,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = supervisor.run() => {
            // Accepting failed repeatedly and the engine is giving up.
            // Errors inside individual sessions do not reach this point.
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    // Tear down explicitly: dropping `notify_shutdown` trips every
    // subscribed observer, and dropping the last completion sender is what
    // lets the `recv()` below return.
    let Supervisor {
        shutdown_complete_tx,
        notify_shutdown,
        ..
    } = supervisor;
    drop(notify_shutdown);
    drop(shutdown_complete_tx);

    let _ = shutdown_complete_rx.recv().await;
    Ok(())
}

impl Supervisor {
    /// Spawn the worker pool, then accept and enqueue clients until told to
    /// stop.
    ///
    /// The `select!` in [`run`] drops this future at shutdown, which closes
    /// the listener and also drops (and thereby closes) a client stream
    /// still waiting for queue space.
    async fn run(&mut self) -> crate::Result<()> {
        // A zero-capacity tokio channel is illegal, so a rendezvous queue
        // degrades to capacity one.
        let (client_tx, client_rx) =
            mpsc::channel(self.config.max_client_connections.max(1));
        let queue = Arc::new(Mutex::new(client_rx));

        for _ in 0..self.config.max_server_connections {
            let worker = DialWorker {
                queue: queue.clone(),
                dialer: self.dialer.clone(),
                config: self.config.clone(),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };
            tokio::spawn(worker.run());
        }

        if self.config.debug {
            tokio::spawn(report_queue_depth(
                client_tx.clone(),
                Shutdown::new(self.notify_shutdown.subscribe()),
            ));
        }

        info!("accepting inbound connections");

        loop {
            let client = self.accept().await?;

            if let Err(err) = client.set_keepalive(self.config.keep_alive, self.config.keep_alive_period)
            {
                warn!(cause = %err, "failed to set keep-alive");
            }

            // The queue is bounded; this blocks, rather than dropping the
            // client, whenever all workers are busy and the queue is full.
            if client_tx.send(client).await.is_err() {
                // Queue receiver gone; nothing left to hand clients to.
                return Ok(());
            }
        }
    }

    /// Accept an inbound connection.
    ///
    /// Errors are handled by backing off and retrying: one second after the
    /// first failure, doubling thereafter. A success resets nothing — each
    /// call starts fresh — but once the wait would exceed 64 seconds the
    /// error is treated as persistent and returned.
    async fn accept(&mut self) -> crate::Result<ClientStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(client) => {
                    debug!("accepted inbound connection");
                    return Ok(client);
                }
                Err(err) => {
                    if backoff > 64 {
                        error!(cause = %err, "failed to accept inbound connection too many times");
                        return Err(err.into());
                    }
                    warn!(cause = %err, "failed to accept inbound connection, retrying in {backoff} seconds");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl DialWorker {
    /// Pull clients off the queue and forward them, one session at a time,
    /// until the queue closes or shutdown is signalled.
    async fn run(mut self) {
        while !self.shutdown.is_shutdown() {
            let maybe_client = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    _ = self.shutdown.recv() => return,
                    client = queue.recv() => client,
                }
            };

            let Some(client) = maybe_client else { return };

            Session {
                dialer: &self.dialer,
                config: &self.config,
                shutdown: &mut self.shutdown,
            }
            .run(client)
            .await;
        }
    }
}

/// Log the queue depth once a second until shutdown. Spawned only when the
/// debug flag is set.
async fn report_queue_depth(queue: mpsc::Sender<ClientStream>, mut shutdown: Shutdown) {
    let mut tick = time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let depth = queue.max_capacity() - queue.capacity();
                debug!(depth, "waiting client connections");
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn test_config(dial_addr: String, max_server: usize, max_client: usize) -> Config {
        Config {
            listen_network: Network::Tcp,
            listen_addr: "127.0.0.1:0".to_string(),
            dial_network: Network::Tcp,
            dial_addr,
            dial_timeout: Duration::from_secs(1),
            pipe_deadline: Duration::from_secs(1),
            retry_time: Duration::from_millis(10),
            max_retry: 1,
            keep_alive: true,
            keep_alive_period: Duration::from_secs(10),
            dial_tls: false,
            tls_skip_verify: false,
            max_server_connections: max_server,
            max_client_connections: max_client,
            debug: false,
        }
    }

    /// An echo server that keeps each connection open until the peer
    /// closes it.
    async fn spawn_echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    /// Bind the relay on an ephemeral port and start the engine.
    async fn spawn_engine(
        config: Config,
    ) -> (
        std::net::SocketAddr,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<crate::Result<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let engine = tokio::spawn(run(Listener::Tcp(listener), config, async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, engine)
    }

    #[tokio::test]
    async fn relays_an_echo_round_trip() {
        let upstream_addr = spawn_echo_upstream().await;
        let config = test_config(upstream_addr, 1, 1);
        let (addr, stop_tx, engine) = spawn_engine(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        let _ = stop_tx.send(());
        time::timeout(Duration::from_secs(5), engine)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closes_the_client_when_the_dial_gives_up() {
        let unreachable = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            drop(listener);
            addr
        };
        let mut config = test_config(unreachable, 1, 1);
        config.max_retry = 3;
        let (addr, stop_tx, engine) = spawn_engine(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let started = std::time::Instant::now();
        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(n, 0);
        // Backoff sleeps of 0, 1 and 4 times the 10ms base before the
        // give-up closed the client.
        assert!(started.elapsed() >= Duration::from_millis(50));

        let _ = stop_tx.send(());
        time::timeout(Duration::from_secs(5), engine)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn services_clients_in_accept_order() {
        // An upstream that records the first byte of every connection, then
        // echoes it back and hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap().to_string();
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let order_tx = order_tx.clone();
                tokio::spawn(async move {
                    let mut byte = [0u8; 1];
                    if socket.read_exact(&mut byte).await.is_ok() {
                        let _ = order_tx.send(byte[0]);
                        let _ = socket.write_all(&byte).await;
                    }
                });
            }
        });

        // One worker and a one-slot queue: the third client parks in the
        // accept path until the queue frees up, and nothing is dropped.
        let config = test_config(upstream_addr, 1, 1);
        let (addr, stop_tx, engine) = spawn_engine(config).await;

        let mut clients = Vec::new();
        for id in 0..3u8 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[id]).await.unwrap();
            clients.push(client);
        }

        for (id, client) in clients.iter_mut().enumerate() {
            let mut byte = [0u8; 1];
            time::timeout(Duration::from_secs(5), client.read_exact(&mut byte))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(byte[0], id as u8);
        }
        for id in 0..3u8 {
            assert_eq!(order_rx.recv().await, Some(id));
        }

        drop(clients);
        let _ = stop_tx.send(());
        time::timeout(Duration::from_secs(5), engine)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shuts_down_while_sessions_are_active() {
        let upstream_addr = spawn_echo_upstream().await;
        let config = test_config(upstream_addr, 2, 5);
        let (addr, stop_tx, engine) = spawn_engine(config).await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        // Let the workers pick sessions up before pulling the plug.
        time::sleep(Duration::from_millis(100)).await;

        let _ = stop_tx.send(());
        time::timeout(Duration::from_secs(5), engine)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
