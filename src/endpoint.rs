//! DTLS endpoint adapter.
//!
//! Wraps the `webrtc-dtls` connection and listener behind deadline-bounded
//! record I/O. Every read and write takes an explicit deadline so the pump
//! loops can observe cancellation between operations; an elapsed deadline is
//! reported as [`EndpointError::Timeout`] and is never fatal by itself.
//!
//! A zero-length read means the remote closed the session. Transport faults
//! and closure get the same treatment from the pumps (the session stops), so
//! the adapter does not distinguish them further.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use webrtc_dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_dtls::listener::listen;
use webrtc_util::conn::{Conn, Listener};

use crate::config::TunnelIdentity;

/// Rustls needs a process-wide crypto backend selected before any
/// connection is established; both `ring` and `aws-lc-rs` end up in the
/// dependency graph, so it can't pick one on its own.
fn ensure_crypto_provider() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Failure of a single endpoint operation.
#[derive(Debug)]
pub enum EndpointError {
    /// The deadline elapsed before the operation completed.
    Timeout,
    /// Socket setup failed.
    Io(std::io::Error),
    /// The DTLS handshake was rejected.
    Handshake(webrtc_dtls::Error),
    /// The session failed or was closed underneath us.
    Transport(webrtc_util::Error),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::Timeout => write!(f, "operation timed out"),
            EndpointError::Io(err) => write!(f, "socket error: {err}"),
            EndpointError::Handshake(err) => write!(f, "handshake failed: {err}"),
            EndpointError::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Timeout => None,
            EndpointError::Io(err) => Some(err),
            EndpointError::Handshake(err) => Some(err),
            EndpointError::Transport(err) => Some(err),
        }
    }
}

impl EndpointError {
    /// True when the operation merely ran out of time and may be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EndpointError::Timeout)
    }
}

/// A connected, record-oriented DTLS handle.
///
/// Record boundaries match datagram boundaries: one `write` produces one
/// record, one `read` consumes one.
pub struct DtlsEndpoint {
    conn: Arc<dyn Conn + Send + Sync>,
}

impl DtlsEndpoint {
    /// Dials `remote` and completes the client handshake within
    /// `handshake_timeout`, presenting the identity's certificate and
    /// verifying the peer against its roots under `server_name`.
    pub async fn dial(
        remote: SocketAddr,
        identity: &TunnelIdentity,
        server_name: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, EndpointError> {
        ensure_crypto_provider();
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(EndpointError::Io)?;
        socket.connect(remote).await.map_err(EndpointError::Io)?;

        let transport: Arc<dyn Conn + Send + Sync> = Arc::new(socket);
        let config = dial_config(identity, server_name);
        let conn = timeout(handshake_timeout, DTLSConn::new(transport, config, true, None))
            .await
            .map_err(|_| EndpointError::Timeout)?
            .map_err(EndpointError::Handshake)?;

        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    fn from_conn(conn: Arc<dyn Conn + Send + Sync>) -> Self {
        Self { conn }
    }

    /// Reads one record into `buf`. `Ok(0)` means the remote closed the
    /// session. Payloads longer than `buf` do not fit in one datagram read.
    pub async fn read(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, EndpointError> {
        match timeout(deadline, self.conn.recv(buf)).await {
            Err(_) => Err(EndpointError::Timeout),
            Ok(Err(err)) => Err(EndpointError::Transport(err)),
            Ok(Ok(n)) => Ok(n),
        }
    }

    /// Writes `buf` as one record, returning the number of bytes accepted.
    pub async fn write(&self, buf: &[u8], deadline: Duration) -> Result<usize, EndpointError> {
        match timeout(deadline, self.conn.send(buf)).await {
            Err(_) => Err(EndpointError::Timeout),
            Ok(Err(err)) => Err(EndpointError::Transport(err)),
            Ok(Ok(n)) => Ok(n),
        }
    }

    /// Closes the session. Errors here are unactionable and dropped.
    pub async fn close(&self) {
        let _ = self.conn.close().await;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }
}

impl fmt::Debug for DtlsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsEndpoint")
            .field("remote", &self.conn.remote_addr())
            .finish()
    }
}

/// A bound DTLS listener requiring client certificates.
pub struct DtlsListener {
    inner: Box<dyn Listener + Send + Sync>,
}

impl DtlsListener {
    /// Binds at `listen_addr` with mutual authentication: the listener
    /// presents the identity's certificate and demands a client certificate
    /// chaining to its roots.
    pub async fn bind(
        listen_addr: SocketAddr,
        identity: &TunnelIdentity,
    ) -> Result<Self, EndpointError> {
        ensure_crypto_provider();
        let config = accept_config(identity);
        let listener = listen(listen_addr, config)
            .await
            .map_err(EndpointError::Handshake)?;
        Ok(Self {
            inner: Box::new(listener),
        })
    }

    /// Waits for the next client and completes its handshake.
    pub async fn accept(&self) -> Result<(DtlsEndpoint, SocketAddr), EndpointError> {
        let (conn, remote) = self.inner.accept().await.map_err(EndpointError::Transport)?;
        Ok((DtlsEndpoint::from_conn(conn), remote))
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.addr().await.ok()
    }

    pub async fn close(&self) {
        let _ = self.inner.close().await;
    }
}

impl fmt::Debug for DtlsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsListener").finish_non_exhaustive()
    }
}

fn dial_config(identity: &TunnelIdentity, server_name: &str) -> Config {
    Config {
        certificates: vec![identity.certificate.clone()],
        extended_master_secret: ExtendedMasterSecretType::Require,
        roots_cas: identity.roots.clone(),
        server_name: server_name.to_string(),
        insecure_skip_verify: identity.insecure_skip_verify,
        ..Default::default()
    }
}

fn accept_config(identity: &TunnelIdentity) -> Config {
    Config {
        certificates: vec![identity.certificate.clone()],
        extended_master_secret: ExtendedMasterSecretType::Require,
        // Self-signed test identities cannot chain to a root, so the relaxed
        // identity still demands a certificate but skips chain verification.
        client_auth: if identity.insecure_skip_verify {
            ClientAuthType::RequireAnyClientCert
        } else {
            ClientAuthType::RequireAndVerifyClientCert
        },
        client_cas: identity.roots.clone(),
        ..Default::default()
    }
}
