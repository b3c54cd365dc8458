//! Role configuration and TLS material.
//!
//! Both roles share one shape: a local bind address, a remote peer, buffer
//! sizing, an idle window, and a [`TunnelIdentity`] (certificate chain, key,
//! root store). The identity is loaded once at startup from PEM files and
//! cloned into every DTLS handshake.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use webrtc_dtls::crypto::{Certificate, CryptoPrivateKey};

/// Deadline for a single blocking read on any socket. Keeps every pump loop
/// responsive to cancellation.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Deadline for a single blocking write or bounded-queue hand-off.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Period of the idle sweeper (ingress) and per-session reaper (egress).
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default window after which a session with no traffic in either direction
/// is reclaimed.
pub const IDLE_LIMIT: Duration = Duration::from_secs(30 * 60);

/// Deadline for the outbound DTLS handshake when a new origin appears.
pub const DIAL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for an inbound DTLS handshake on the egress listener.
pub const ACCEPT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default datagram buffer capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1500;

/// Default bounded-queue capacity, in datagrams.
pub const DEFAULT_BUFFER_COUNT: usize = 1500;

/// Local certificate material plus the peer trust anchors.
#[derive(Clone)]
pub struct TunnelIdentity {
    /// Our certificate chain and private key, presented in every handshake.
    pub certificate: Certificate,
    /// Roots the remote peer's certificate must chain to.
    pub roots: RootCertStore,
    /// Skips peer-chain verification. Exists for tests with throwaway
    /// self-signed identities; there is no flag that sets it.
    pub insecure_skip_verify: bool,
}

impl TunnelIdentity {
    /// Builds an identity from an already-assembled certificate and roots.
    pub fn new(certificate: Certificate, roots: RootCertStore) -> Self {
        Self {
            certificate,
            roots,
            insecure_skip_verify: false,
        }
    }

    /// Loads the identity from PEM files: a certificate chain, its private
    /// key, and the root certificates to trust the peer against.
    pub fn load(cert_path: &Path, key_path: &Path, root_ca_path: &Path) -> Result<Self> {
        let chain = read_cert_chain(cert_path)
            .with_context(|| format!("failed to load certificate {}", cert_path.display()))?;
        anyhow::ensure!(
            !chain.is_empty(),
            "no certificates found in {}",
            cert_path.display()
        );

        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read key {}", key_path.display()))?;
        let key_pair = rcgen::KeyPair::from_pem(&key_pem)
            .with_context(|| format!("failed to parse key {}", key_path.display()))?;
        let private_key = CryptoPrivateKey::from_key_pair(&key_pair)
            .context("unsupported private key type")?;

        let mut roots = RootCertStore::empty();
        let root_certs = read_cert_chain(root_ca_path)
            .with_context(|| format!("failed to load root CA {}", root_ca_path.display()))?;
        anyhow::ensure!(
            !root_certs.is_empty(),
            "no certificates found in {}",
            root_ca_path.display()
        );
        for root in root_certs {
            roots
                .add(root)
                .context("rejected root CA certificate")?;
        }

        Ok(Self {
            certificate: Certificate {
                certificate: chain,
                private_key,
            },
            roots,
            insecure_skip_verify: false,
        })
    }
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    Ok(certs)
}

/// Settings shared by both roles.
#[derive(Clone)]
pub struct CommonConfig {
    /// Ingress: the plaintext UDP bind. Egress: the DTLS listener bind.
    pub listen: SocketAddr,
    /// Ingress: the remote DTLS listener. Egress: the plaintext destination.
    pub remote: SocketAddr,
    /// Datagram buffer capacity; larger payloads are truncated on read.
    pub buffer_size: usize,
    /// Capacity of every bounded queue, in datagrams.
    pub buffer_count: usize,
    /// Sessions quiet in both directions for this long are reclaimed.
    pub idle_limit: Duration,
    pub identity: TunnelIdentity,
}

/// Configuration for the plaintext-accepting role.
#[derive(Clone)]
pub struct IngressConfig {
    pub common: CommonConfig,
    /// Name the remote DTLS certificate is verified against.
    pub server_name: String,
}

/// Configuration for the DTLS-terminating role.
#[derive(Clone)]
pub struct EgressConfig {
    pub common: CommonConfig,
}
