//! Tunnel entry point: parse arguments, load certificate material, run the
//! selected role until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use dgram_tunnel::config::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, IDLE_LIMIT};
use dgram_tunnel::{CommonConfig, Egress, EgressConfig, Ingress, IngressConfig, TunnelIdentity};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Accept plaintext datagrams and tunnel them to the remote peer.
    Ingress,
    /// Terminate tunnels and relay datagrams to the plaintext destination.
    Egress,
}

#[derive(Parser, Debug)]
#[command(name = "dgram-tunnel", version, about = "Bidirectional DTLS-over-UDP datagram tunnel")]
struct Args {
    #[arg(long, value_enum)]
    mode: Mode,

    /// Ingress: plaintext UDP bind address. Egress: DTLS listener bind.
    #[arg(long, default_value = "0.0.0.0:10000")]
    listen: SocketAddr,

    /// Ingress: remote DTLS listener. Egress: plaintext destination.
    #[arg(long, default_value = "127.0.0.1:20000")]
    remote: SocketAddr,

    /// PEM certificate chain presented in every handshake.
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key matching --cert.
    #[arg(long)]
    key: PathBuf,

    /// PEM root certificates the peer must chain to.
    #[arg(long)]
    root_ca: PathBuf,

    /// Datagram buffer capacity in bytes; longer payloads are truncated.
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Capacity of every forwarding queue, in datagrams.
    #[arg(long, default_value_t = DEFAULT_BUFFER_COUNT)]
    buffer_count: usize,

    /// Name the remote certificate is verified against (ingress only).
    /// Defaults to the host part of --remote.
    #[arg(long)]
    server_name: Option<String>,

    /// Reclaim sessions with no traffic in either direction for this many
    /// seconds.
    #[arg(long, default_value_t = IDLE_LIMIT.as_secs())]
    idle_limit_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let identity = TunnelIdentity::load(&args.cert, &args.key, &args.root_ca)
        .context("failed to load certificate material")?;

    let common = CommonConfig {
        listen: args.listen,
        remote: args.remote,
        buffer_size: args.buffer_size,
        buffer_count: args.buffer_count,
        idle_limit: Duration::from_secs(args.idle_limit_secs),
        identity,
    };

    match args.mode {
        Mode::Ingress => {
            let server_name = args
                .server_name
                .unwrap_or_else(|| args.remote.ip().to_string());
            let engine = Ingress::bind(IngressConfig {
                common,
                server_name,
            })
            .await?;
            shutdown_on_signal({
                let engine = engine.clone();
                move || engine.shutdown()
            });
            engine.run().await
        }
        Mode::Egress => {
            let engine = Egress::bind(EgressConfig { common }).await?;
            shutdown_on_signal({
                let engine = engine.clone();
                move || engine.shutdown()
            });
            engine.run().await
        }
    }
}

/// Arms a task that triggers a graceful shutdown on SIGINT or SIGTERM.
fn shutdown_on_signal(shutdown: impl Fn() + Send + 'static) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = wait_for_sigterm() => {}
        }
        info!("shutdown signal received");
        shutdown();
    });
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
