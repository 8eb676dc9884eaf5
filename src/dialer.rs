//! Upstream dialing with per-attempt timeouts and quadratic retry backoff.

use crate::{
    config::{Config, Network},
    error::Error,
    shutdown::Shutdown,
    stream::UpstreamStream,
    Result,
};
use std::{io, sync::Arc};
use tokio::{
    net::{TcpStream, UnixStream},
    time,
};
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, RootCertStore, SignatureScheme,
    },
    TlsConnector,
};
use tracing::{error, warn};

/// Opens upstream connections on behalf of the workers.
///
/// The TLS client configuration and the SNI name are resolved once at
/// startup, so a bad `--dial-addr` host fails the engine immediately instead
/// of on the first session. The handle is cheap to clone; every worker gets
/// its own.
#[derive(Clone)]
pub(crate) struct Dialer {
    config: Arc<Config>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("config", &self.config)
            .field("tls", &self.tls.as_ref().map(|(_, name)| name))
            .finish()
    }
}

impl Dialer {
    pub(crate) fn new(config: Arc<Config>) -> Result<Self> {
        let tls = if config.dial_tls {
            let host = host_of(&config.dial_addr);
            let name = ServerName::try_from(host.to_owned())
                .map_err(|_| Error::InvalidServerName(config.dial_addr.clone()))?;
            let connector =
                TlsConnector::from(Arc::new(tls_client_config(config.tls_skip_verify)));
            Some((connector, name))
        } else {
            None
        };

        Ok(Dialer { config, tls })
    }

    /// Open one upstream stream, retrying with quadratic backoff.
    ///
    /// Attempt `i` runs under `dial_timeout` and is followed, on failure, by
    /// a sleep of `retry_time * i * i`; the first retry is therefore
    /// immediate and meaningful backoff starts with the second. Both the
    /// dial and the sleep abort as soon as `shutdown` fires, without
    /// consuming the remaining attempts.
    pub(crate) async fn open_upstream(&self, shutdown: &mut Shutdown) -> Result<UpstreamStream> {
        for attempt in 0..self.config.max_retry {
            let outcome = tokio::select! {
                dialed = time::timeout(self.config.dial_timeout, self.connect()) => match dialed {
                    Ok(dialed) => dialed,
                    Err(_) => Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "dial timed out",
                    ))),
                },
                _ = shutdown.recv() => return Err(Error::Cancelled),
            };

            match outcome {
                Ok(upstream) => return Ok(upstream),
                // A missing session model for the transport is a config
                // problem; retrying cannot fix it.
                Err(err @ Error::UnsupportedNetwork(_)) => return Err(err),
                Err(err) => error!(cause = %err, addr = %self.config.dial_addr, "dial failed"),
            }

            let backoff = self
                .config
                .retry_time
                .saturating_mul(attempt.saturating_mul(attempt));
            if !backoff.is_zero() {
                tokio::select! {
                    _ = time::sleep(backoff) => {}
                    _ = shutdown.recv() => return Err(Error::Cancelled),
                }
            }
        }

        Err(Error::DialGiveUp(self.config.dial_addr.clone()))
    }

    async fn connect(&self) -> Result<UpstreamStream> {
        match self.config.dial_network {
            Network::Tcp => {
                let stream = TcpStream::connect(&self.config.dial_addr).await?;
                match &self.tls {
                    Some((connector, name)) => {
                        let stream = connector.connect(name.clone(), stream).await?;
                        Ok(UpstreamStream::Tls(Box::new(stream)))
                    }
                    None => Ok(UpstreamStream::Tcp(stream)),
                }
            }
            Network::Unix => {
                let stream = UnixStream::connect(&self.config.dial_addr).await?;
                Ok(UpstreamStream::Unix(stream))
            }
            Network::Udp => Err(Error::UnsupportedNetwork(Network::Udp)),
        }
    }
}

/// The host part of a `host:port` address, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn tls_client_config(skip_verify: bool) -> rustls::ClientConfig {
    if skip_verify {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in native.errors {
            warn!(cause = %err, "skipping unreadable platform root certificate");
        }
        for cert in native.certs {
            if let Err(err) = roots.add(cert) {
                warn!(cause = %err, "skipping invalid platform root certificate");
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Certificate verifier behind `--tls-skip-verify`: accepts any server
/// certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
