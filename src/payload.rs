//! # Datagram Buffers and Buffer Pool
//!
//! A [`Payload`] is a fixed-capacity buffer holding exactly one UDP datagram.
//! Payloads are move-only: whichever task holds the value owns the bytes, and
//! handing a payload through a channel transfers that ownership. Returning a
//! payload to the [`PayloadPool`] consumes it, so a buffer can never be
//! released twice or observed after release.
//!
//! The pool amortizes allocations across the forwarding pipelines: `acquire`
//! never blocks (it allocates when the free list is empty) and `release`
//! resets the datagram length before recycling. The pool also tracks how many
//! payloads are currently out, which the engines log at shutdown and the
//! tests use to prove buffer conservation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A single datagram: fixed-capacity storage plus the filled length.
///
/// The length is zero on acquire, set once when a read fills the buffer, and
/// reset by the pool on release.
#[derive(Debug)]
pub struct Payload {
    store: Box<[u8]>,
    len: usize,
}

impl Payload {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            store: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// The full writable region, for handing to a socket read.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.store
    }

    /// Records how many bytes of the buffer a read filled.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.store.len());
        self.len = len.min(self.store.len());
    }

    /// The filled bytes.
    pub fn data(&self) -> &[u8] {
        &self.store[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

/// A return-path datagram: the payload plus the origin it must go back to.
#[derive(Debug)]
pub struct Package {
    pub origin: SocketAddr,
    pub payload: Payload,
}

impl Package {
    pub fn new(origin: SocketAddr, payload: Payload) -> Self {
        Self { origin, payload }
    }
}

/// Free-list pool of datagram buffers.
///
/// Thread-safe and non-blocking: exhaustion allocates rather than waits, so
/// the steady state performs no allocation while bursts still make progress.
#[derive(Debug)]
pub struct PayloadPool {
    capacity: usize,
    free: Mutex<Vec<Payload>>,
    outstanding: AtomicUsize,
}

impl PayloadPool {
    /// Creates a pool handing out buffers of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Takes a zero-length buffer from the free list, allocating if empty.
    pub fn acquire(&self) -> Payload {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Payload::with_capacity(self.capacity))
    }

    /// Returns a buffer to the free list, resetting its length.
    ///
    /// Consumes the payload: the borrow checker is what rules out a
    /// double-release or a use-after-release.
    pub fn release(&self, mut payload: Payload) {
        debug_assert_eq!(payload.capacity(), self.capacity);
        payload.clear();
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if let Ok(mut free) = self.free.lock() {
            free.push(payload);
        }
    }

    /// How many payloads are acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
