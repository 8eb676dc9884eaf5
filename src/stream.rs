//! Concrete listener and stream types for the supported transports.
//!
//! The engine is generic over "a bidirectional byte stream"; these enums
//! pin that down to the transports the relay actually speaks: plain TCP,
//! unix domain sockets, and TLS-wrapped TCP on the upstream leg. Each enum
//! implements [`AsyncRead`] and [`AsyncWrite`] by delegating to the wrapped
//! socket, so the rest of the crate can split, copy and shut them down
//! without caring which variant it holds.

use crate::{
    config::Network,
    error::Error,
    Result,
};
use socket2::{SockRef, TcpKeepalive};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::client::TlsStream;

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listener for the given transport family.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the address cannot be bound, or with
    /// [`Error::UnsupportedNetwork`] for `udp`: the relay forwards ordered
    /// byte streams and has no session model for datagrams.
    pub async fn bind(network: Network, addr: &str) -> Result<Listener> {
        match network {
            Network::Tcp => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Network::Unix => Ok(Listener::Unix(UnixListener::bind(addr)?)),
            Network::Udp => Err(Error::UnsupportedNetwork(Network::Udp)),
        }
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> io::Result<ClientStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ClientStream::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ClientStream::Unix(stream))
            }
        }
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    /// Apply TCP keep-alive settings to the client socket.
    ///
    /// Keep-alive is a transport-level concept; unix sockets have no notion
    /// of it and are left untouched. The upstream leg never gets keep-alive
    /// at all, which is why this lives on the client type only.
    pub fn set_keepalive(&self, enable: bool, period: Duration) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => {
                let socket = SockRef::from(stream);
                if enable {
                    let params = TcpKeepalive::new().with_time(period).with_interval(period);
                    socket.set_tcp_keepalive(&params)
                } else {
                    socket.set_keepalive(false)
                }
            }
            ClientStream::Unix(_) => Ok(()),
        }
    }
}

/// A dialed upstream connection, possibly TLS-wrapped.
#[derive(Debug)]
pub enum UpstreamStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            UpstreamStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            UpstreamStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            UpstreamStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            UpstreamStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_a_udp_listener() {
        let err = Listener::bind(Network::Udp, "127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedNetwork(Network::Udp)));
    }

    #[tokio::test]
    async fn accepts_over_a_unix_socket() {
        let path = std::env::temp_dir().join(format!("ponte-stream-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let listener = Listener::bind(Network::Unix, &path.to_string_lossy())
            .await
            .unwrap();
        let (connected, accepted) =
            tokio::join!(UnixStream::connect(&path), listener.accept());

        connected.unwrap();
        assert!(matches!(accepted.unwrap(), ClientStream::Unix(_)));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn applies_keepalive_to_tcp_clients() {
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0").await.unwrap();
        let addr = match &listener {
            Listener::Tcp(listener) => listener.local_addr().unwrap(),
            Listener::Unix(_) => unreachable!(),
        };

        let (connected, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let _connected = connected.unwrap();
        let accepted = accepted.unwrap();

        accepted
            .set_keepalive(true, Duration::from_secs(10))
            .unwrap();
        accepted
            .set_keepalive(false, Duration::from_secs(10))
            .unwrap();
    }
}
