//! # Ingress Engine
//!
//! The plaintext-accepting side of the tunnel. One UDP socket faces the local
//! clients; every distinct client address gets its own DTLS session to the
//! remote egress, owned by an [`IngressMapper`].
//!
//! ## Task layout
//!
//! The engine runs the intake loop inline in [`Ingress::run`] and keeps two
//! service tasks beside it:
//!
//! - **intake loop**: reads datagrams off the listener, demuxes by source
//!   address, creates or reuses the origin's mapper, hands the buffer over.
//! - **response loop**: writes return datagrams back to their origins
//!   through the listener socket, so replies carry the listener address as
//!   their source (what NAT-bound clients expect).
//! - **idle sweeper**: periodically stops mappers quiet in both directions.
//!
//! Each mapper runs three pumps of its own: uplink (queue → tunnel),
//! downlink (tunnel → queue), and dispatch (queue → engine response queue).
//!
//! ## Shutdown
//!
//! Cancelling the root token stops the intake loop and every mapper (their
//! tokens are children). `run` then waits for the mapper set, fires the
//! drain token to stop the response loop after it has released everything
//! still queued, and reports the buffer balance.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityRecorder;
use crate::config::{
    IngressConfig, DIAL_HANDSHAKE_TIMEOUT, READ_TIMEOUT, SWEEP_INTERVAL, WRITE_TIMEOUT,
};
use crate::endpoint::DtlsEndpoint;
use crate::payload::{Package, Payload, PayloadPool};
use crate::session_table::{Insert, SessionTable};

/// The plaintext-accepting engine. Bind once, then [`Ingress::run`] until
/// [`Ingress::shutdown`] (or a fatal listener error) stops it.
pub struct Ingress {
    config: Arc<IngressConfig>,
    socket: Arc<UdpSocket>,
    table: Arc<SessionTable<Arc<IngressMapper>>>,
    pool: Arc<PayloadPool>,
    respond_tx: mpsc::Sender<Package>,
    respond_rx: Mutex<Option<mpsc::Receiver<Package>>>,
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl Ingress {
    /// Binds the plaintext listener. Fails fast on an unusable address.
    pub async fn bind(config: IngressConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.common.listen)
            .await
            .with_context(|| format!("failed to bind UDP listener at {}", config.common.listen))?;
        let (respond_tx, respond_rx) = mpsc::channel(config.common.buffer_count);
        let pool = Arc::new(PayloadPool::new(config.common.buffer_size));

        Ok(Arc::new(Self {
            config: Arc::new(config),
            socket: Arc::new(socket),
            table: Arc::new(SessionTable::new()),
            pool,
            respond_tx,
            respond_rx: Mutex::new(Some(respond_rx)),
            cancel: CancellationToken::new(),
            drain: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("listener has no local address")
    }

    /// Requests a graceful stop. Returns immediately; `run` unwinds.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Live sessions, one per origin address.
    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Buffers currently acquired from the pool and not yet returned.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    /// Serves until shutdown, then tears everything down in order: mappers
    /// first, service tasks after, so queued return traffic either goes out
    /// or goes back to the pool.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let local = self.local_addr()?;
        info!(listen = %local, remote = %self.config.common.remote, "ingress engine running");

        let respond_rx = self
            .respond_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .context("ingress engine is already running")?;

        let mut services = JoinSet::new();
        {
            let engine = self.clone();
            services.spawn(async move { engine.respond_loop(respond_rx).await });
        }
        {
            let engine = self.clone();
            services.spawn(async move { engine.sweep_loop().await });
        }

        let mut mappers = JoinSet::new();
        let outcome = self.intake_loop(&mut mappers).await;

        while mappers.join_next().await.is_some() {}
        self.drain.cancel();
        while services.join_next().await.is_some() {}

        info!(
            outstanding = self.pool.outstanding(),
            "ingress engine stopped"
        );
        outcome
    }

    async fn intake_loop(&self, mappers: &mut JoinSet<()>) -> Result<()> {
        loop {
            // Reap mapper tasks that finished since the last datagram.
            while mappers.try_join_next().is_some() {}

            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let mut payload = self.pool.acquire();
            match timeout(READ_TIMEOUT, self.socket.recv_from(payload.space())).await {
                Err(_) => self.pool.release(payload),
                Ok(Err(err)) => {
                    self.pool.release(payload);
                    error!(error = %err, "listener read failed, shutting down");
                    self.cancel.cancel();
                    return Err(err).context("listener read failed");
                }
                Ok(Ok((len, origin))) => {
                    payload.set_len(len);
                    self.deliver(origin, payload, mappers).await;
                }
            }
        }
    }

    /// Routes one inbound datagram to its origin's mapper, creating the
    /// mapper if this is the first datagram from that address.
    async fn deliver(&self, origin: SocketAddr, payload: Payload, mappers: &mut JoinSet<()>) {
        let key = origin.to_string();
        if let Some(mapper) = self.table.get(&key) {
            mapper.forward(payload).await;
            return;
        }

        let (mapper, write_rx) = IngressMapper::new(self, origin);
        match self.table.insert_if_absent(key.clone(), mapper.clone()) {
            Insert::Existing(prior) => {
                // Lost the install race; the datagram goes to the winner.
                prior.forward(payload).await;
            }
            Insert::Installed => {
                info!(origin = %key, "new session");
                let table = self.table.clone();
                let runner = mapper.clone();
                mappers.spawn(async move {
                    runner.clone().run(write_rx).await;
                    table.remove(&runner.origin_key);
                    debug!(origin = %runner.origin_key, "session removed");
                });
                mapper.forward(payload).await;
            }
        }
    }

    async fn respond_loop(&self, mut respond_rx: mpsc::Receiver<Package>) {
        loop {
            tokio::select! {
                _ = self.drain.cancelled() => break,
                received = respond_rx.recv() => match received {
                    Some(package) => self.write_back(package).await,
                    None => return,
                },
            }
        }
        // Drained after the mappers: anything still queued goes back to the
        // pool instead of leaking.
        respond_rx.close();
        while let Ok(package) = respond_rx.try_recv() {
            self.pool.release(package.payload);
        }
    }

    async fn write_back(&self, package: Package) {
        let Package { origin, payload } = package;
        match timeout(WRITE_TIMEOUT, self.socket.send_to(payload.data(), origin)).await {
            Err(_) => warn!(origin = %origin, "return write timed out, datagram dropped"),
            Ok(Err(err)) => warn!(origin = %origin, error = %err, "return write failed"),
            Ok(Ok(_)) => {}
        }
        self.pool.release(payload);
    }

    async fn sweep_loop(&self) {
        let idle_limit = self.config.common.idle_limit;
        let mut ticker = interval(SWEEP_INTERVAL.min(idle_limit));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.table.for_each(|key, mapper| {
                        if mapper.is_idle(idle_limit) {
                            info!(origin = %key, "reclaiming idle session");
                            mapper.stop();
                        }
                        true
                    });
                }
            }
        }
    }
}

/// Per-origin session state: the DTLS endpoint plus the queues feeding it.
///
/// Created on the first datagram from an origin, registered in the session
/// table, and torn down on idle reclamation, session failure, or engine
/// shutdown. Removal from the table is done by the task that spawned it,
/// after `run` returns, so the mapper holds no reference back to the engine.
pub(crate) struct IngressMapper {
    origin: SocketAddr,
    origin_key: String,
    config: Arc<IngressConfig>,
    write_tx: mpsc::Sender<Payload>,
    respond_tx: mpsc::Sender<Package>,
    pool: Arc<PayloadPool>,
    activity: ActivityRecorder,
    cancel: CancellationToken,
}

impl IngressMapper {
    fn new(engine: &Ingress, origin: SocketAddr) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (write_tx, write_rx) = mpsc::channel(engine.config.common.buffer_count);
        let mapper = Arc::new(Self {
            origin,
            origin_key: origin.to_string(),
            config: engine.config.clone(),
            write_tx,
            respond_tx: engine.respond_tx.clone(),
            pool: engine.pool.clone(),
            activity: ActivityRecorder::new(),
            cancel: engine.cancel.child_token(),
        });
        (mapper, write_rx)
    }

    /// Queues one datagram for the tunnel. Saturation drops the datagram
    /// after `WRITE_TIMEOUT` rather than wedging the intake loop.
    async fn forward(&self, payload: Payload) {
        match self.write_tx.send_timeout(payload, WRITE_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(payload)) => {
                warn!(origin = %self.origin_key, "uplink queue saturated, datagram dropped");
                self.pool.release(payload);
            }
            Err(SendTimeoutError::Closed(payload)) => {
                debug!(origin = %self.origin_key, "session closing, datagram dropped");
                self.pool.release(payload);
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_idle(&self, threshold: Duration) -> bool {
        self.activity.is_idle(threshold)
    }

    /// Dials the tunnel, then pumps until cancelled or the session fails.
    /// Every queued buffer is back in the pool by the time this returns.
    async fn run(self: Arc<Self>, mut write_rx: mpsc::Receiver<Payload>) {
        let common = &self.config.common;
        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => {
                drain_queue(&mut write_rx, &self.pool);
                return;
            }
            dialed = DtlsEndpoint::dial(
                common.remote,
                &common.identity,
                &self.config.server_name,
                DIAL_HANDSHAKE_TIMEOUT,
            ) => dialed,
        };
        let endpoint = match dialed {
            Ok(endpoint) => endpoint,
            Err(err) => {
                info!(origin = %self.origin_key, error = %err, "tunnel dial failed");
                self.cancel.cancel();
                drain_queue(&mut write_rx, &self.pool);
                return;
            }
        };
        debug!(origin = %self.origin_key, "tunnel established");

        let (read_tx, mut read_rx) = mpsc::channel(common.buffer_count);
        tokio::join!(
            self.uplink_pump(&endpoint, &mut write_rx),
            self.downlink_pump(&endpoint, read_tx),
            self.dispatch_pump(&mut read_rx),
        );

        endpoint.close().await;
        drain_queue(&mut write_rx, &self.pool);
        drain_queue(&mut read_rx, &self.pool);
        info!(origin = %self.origin_key, "session closed");
    }

    /// Uplink: local datagrams out through the tunnel.
    async fn uplink_pump(&self, endpoint: &DtlsEndpoint, write_rx: &mut mpsc::Receiver<Payload>) {
        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = write_rx.recv() => match received {
                    Some(payload) => payload,
                    None => return,
                },
            };
            match endpoint.write(payload.data(), WRITE_TIMEOUT).await {
                Ok(written) if written == payload.len() => {
                    self.activity.refresh_write();
                    self.pool.release(payload);
                }
                Ok(written) => {
                    info!(
                        origin = %self.origin_key,
                        written,
                        expected = payload.len(),
                        "short tunnel write, stopping session"
                    );
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
                Err(err) => {
                    info!(origin = %self.origin_key, error = %err, "tunnel write failed, stopping session");
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }

    /// Downlink: tunnel records into the read queue.
    async fn downlink_pump(&self, endpoint: &DtlsEndpoint, read_tx: mpsc::Sender<Payload>) {
        while !self.cancel.is_cancelled() {
            let mut payload = self.pool.acquire();
            match endpoint.read(payload.space(), READ_TIMEOUT).await {
                Err(err) if err.is_timeout() => self.pool.release(payload),
                Err(err) => {
                    info!(origin = %self.origin_key, error = %err, "tunnel read failed, stopping session");
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
                Ok(0) => {
                    debug!(origin = %self.origin_key, "tunnel closed by remote");
                    self.pool.release(payload);
                    self.cancel.cancel();
                    return;
                }
                Ok(len) => {
                    payload.set_len(len);
                    self.activity.refresh_read();
                    match read_tx.send_timeout(payload, WRITE_TIMEOUT).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(payload)) => {
                            warn!(origin = %self.origin_key, "downlink queue saturated, datagram dropped");
                            self.pool.release(payload);
                        }
                        Err(SendTimeoutError::Closed(payload)) => {
                            self.pool.release(payload);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch: read queue into the engine's response queue, stamped with
    /// the origin the reply must return to.
    async fn dispatch_pump(&self, read_rx: &mut mpsc::Receiver<Payload>) {
        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = read_rx.recv() => match received {
                    Some(payload) => payload,
                    // Downlink pump is gone; nothing more will arrive.
                    None => return,
                },
            };
            let package = Package::new(self.origin, payload);
            match self.respond_tx.send_timeout(package, WRITE_TIMEOUT).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(package)) => {
                    warn!(origin = %self.origin_key, "response queue saturated, datagram dropped");
                    self.pool.release(package.payload);
                }
                Err(SendTimeoutError::Closed(package)) => {
                    self.pool.release(package.payload);
                    return;
                }
            }
        }
    }
}

/// Closes a payload queue and returns everything still inside to the pool.
fn drain_queue(rx: &mut mpsc::Receiver<Payload>, pool: &PayloadPool) {
    rx.close();
    while let Ok(payload) = rx.try_recv() {
        pool.release(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_queue_releases_everything() {
        let pool = PayloadPool::new(32);
        let (tx, mut rx) = mpsc::channel(8);
        for _ in 0..5 {
            tx.send(pool.acquire()).await.expect("queue has room");
        }
        assert_eq!(pool.outstanding(), 5);
        drain_queue(&mut rx, &pool);
        assert_eq!(pool.outstanding(), 0);

        // The closed queue rejects further hand-offs without losing the buffer.
        let payload = pool.acquire();
        match tx.send_timeout(payload, Duration::from_millis(10)).await {
            Err(SendTimeoutError::Closed(payload)) => pool.release(payload),
            other => panic!("expected closed queue, got {other:?}"),
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
