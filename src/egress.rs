//! # Egress Engine
//!
//! The DTLS-terminating side of the tunnel. A mutual-auth listener accepts
//! sessions from remote ingresses; every accepted session gets an
//! [`EgressMapper`] that dials its own plaintext UDP socket to the configured
//! destination, so each remote origin shows up at the destination as a
//! distinct source port.
//!
//! Each mapper relays in both directions (tunnel → destination and back) and
//! reaps itself once both directions have been quiet past the idle limit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityRecorder;
use crate::config::{
    EgressConfig, ACCEPT_HANDSHAKE_TIMEOUT, READ_TIMEOUT, SWEEP_INTERVAL, WRITE_TIMEOUT,
};
use crate::endpoint::{DtlsEndpoint, DtlsListener};
use crate::payload::PayloadPool;

/// Delay before retrying after a failed accept, so a broken listener cannot
/// spin the accept loop hot.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive accept failures after which the listener is considered dead
/// and the engine shuts down. Only a successful accept resets the count.
const MAX_ACCEPT_FAILURES: u32 = 10;

/// The DTLS-terminating engine. Bind once, then [`Egress::run`] until
/// [`Egress::shutdown`] stops it.
pub struct Egress {
    config: Arc<EgressConfig>,
    listener: DtlsListener,
    pool: Arc<PayloadPool>,
    cancel: CancellationToken,
}

impl Egress {
    /// Binds the mutual-auth DTLS listener. Fails fast on an unusable
    /// address or rejected certificate material.
    pub async fn bind(config: EgressConfig) -> Result<Arc<Self>> {
        let listener = DtlsListener::bind(config.common.listen, &config.common.identity)
            .await
            .with_context(|| format!("failed to bind DTLS listener at {}", config.common.listen))?;
        let pool = Arc::new(PayloadPool::new(config.common.buffer_size));

        Ok(Arc::new(Self {
            config: Arc::new(config),
            listener,
            pool,
            cancel: CancellationToken::new(),
        }))
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().await
    }

    /// Requests a graceful stop. Returns immediately; `run` unwinds.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Buffers currently acquired from the pool and not yet returned.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    /// Accepts sessions until shutdown, then waits for every mapper before
    /// closing the listener.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            listen = %self.config.common.listen,
            destination = %self.config.common.remote,
            "egress engine running"
        );

        let mut mappers = JoinSet::new();
        let outcome = self.accept_loop(&mut mappers).await;

        while mappers.join_next().await.is_some() {}
        self.listener.close().await;

        info!(
            outstanding = self.pool.outstanding(),
            "egress engine stopped"
        );
        outcome
    }

    async fn accept_loop(&self, mappers: &mut JoinSet<()>) -> Result<()> {
        let mut failures = 0u32;
        loop {
            // Reap mapper tasks that finished since the last accept.
            while mappers.try_join_next().is_some() {}

            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = timeout(ACCEPT_HANDSHAKE_TIMEOUT, self.listener.accept()) => accepted,
            };
            match accepted {
                Err(_) => {
                    debug!("no handshake completed inside the accept window");
                    continue;
                }
                Ok(Err(err)) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    failures += 1;
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!(error = %err, "listener is not recovering, shutting down");
                        self.cancel.cancel();
                        return Err(err).context("accept failed repeatedly");
                    }
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Ok(Ok((tunnel, peer))) => {
                    failures = 0;
                    info!(peer = %peer, "session accepted");
                    let mapper = EgressMapper::new(self, tunnel, peer);
                    mappers.spawn(mapper.run());
                }
            }
        }
    }
}

/// Per-session relay: one accepted DTLS endpoint coupled to one freshly
/// dialed plaintext socket, pumped in both directions until the session
/// fails, goes idle, or the engine shuts down.
struct EgressMapper {
    peer: SocketAddr,
    tunnel: DtlsEndpoint,
    destination: SocketAddr,
    idle_limit: Duration,
    pool: Arc<PayloadPool>,
    activity: ActivityRecorder,
    cancel: CancellationToken,
}

impl EgressMapper {
    fn new(engine: &Egress, tunnel: DtlsEndpoint, peer: SocketAddr) -> Self {
        Self {
            peer,
            tunnel,
            destination: engine.config.common.remote,
            idle_limit: engine.config.common.idle_limit,
            pool: engine.pool.clone(),
            activity: ActivityRecorder::new(),
            cancel: engine.cancel.child_token(),
        }
    }

    async fn run(self) {
        let socket = match self.dial_destination().await {
            Ok(socket) => socket,
            Err(err) => {
                info!(peer = %self.peer, error = %err, "destination dial failed");
                self.tunnel.close().await;
                return;
            }
        };
        debug!(peer = %self.peer, destination = %self.destination, "session relaying");

        tokio::join!(
            self.downstream_pump(&socket),
            self.upstream_pump(&socket),
            self.reap_idle(),
        );

        self.tunnel.close().await;
        info!(peer = %self.peer, "session closed");
    }

    async fn dial_destination(&self) -> std::io::Result<UdpSocket> {
        let local: SocketAddr = if self.destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.destination).await?;
        Ok(socket)
    }

    /// Tunnel records out to the plaintext destination.
    async fn downstream_pump(&self, socket: &UdpSocket) {
        while !self.cancel.is_cancelled() {
            let mut payload = self.pool.acquire();
            match self.tunnel.read(payload.space(), READ_TIMEOUT).await {
                Err(err) if err.is_timeout() => self.pool.release(payload),
                Err(err) => {
                    info!(peer = %self.peer, error = %err, "tunnel read failed, stopping session");
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
                Ok(0) => {
                    debug!(peer = %self.peer, "tunnel closed by remote");
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
                Ok(len) => {
                    payload.set_len(len);
                    self.activity.refresh_read();
                    let outcome = timeout(WRITE_TIMEOUT, socket.send(payload.data())).await;
                    self.pool.release(payload);
                    match outcome {
                        // Best-effort UDP: the datagram is lost, the session lives.
                        Err(_) => {
                            warn!(peer = %self.peer, "destination write timed out, datagram dropped")
                        }
                        Ok(Err(err)) => {
                            info!(peer = %self.peer, error = %err, "destination write failed, stopping session");
                            self.cancel.cancel();
                            return;
                        }
                        Ok(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Destination datagrams back into the tunnel.
    async fn upstream_pump(&self, socket: &UdpSocket) {
        while !self.cancel.is_cancelled() {
            let mut payload = self.pool.acquire();
            match timeout(READ_TIMEOUT, socket.recv(payload.space())).await {
                Err(_) => self.pool.release(payload),
                Ok(Err(err)) => {
                    info!(peer = %self.peer, error = %err, "destination read failed, stopping session");
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
                Ok(Ok(len)) => {
                    payload.set_len(len);
                    match self.tunnel.write(payload.data(), WRITE_TIMEOUT).await {
                        Ok(written) if written == payload.len() => {
                            self.activity.refresh_write();
                            self.pool.release(payload);
                        }
                        Ok(written) => {
                            info!(
                                peer = %self.peer,
                                written,
                                expected = payload.len(),
                                "short tunnel write, stopping session"
                            );
                            self.pool.release(payload);
                            self.cancel.cancel();
                            return;
                        }
                        Err(err) => {
                            info!(peer = %self.peer, error = %err, "tunnel write failed, stopping session");
                            self.pool.release(payload);
                            self.cancel.cancel();
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn reap_idle(&self) {
        let mut ticker = interval(SWEEP_INTERVAL.min(self.idle_limit));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.activity.is_idle(self.idle_limit) {
                        info!(peer = %self.peer, "reclaiming idle session");
                        self.cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}
