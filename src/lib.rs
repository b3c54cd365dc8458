//! # dgram-tunnel
//!
//! A bidirectional DTLS-over-UDP tunnel. The **ingress** role accepts
//! plaintext UDP datagrams from local clients and forwards them through
//! mutually-authenticated DTLS sessions, one session per client address.
//! The **egress** role terminates those sessions and relays the decrypted
//! datagrams to a plaintext destination; replies flow back along the same
//! session to the client that sent the request.
//!
//! Datagram boundaries are preserved end to end (one datagram, one DTLS
//! record, no framing added), per-client ordering is preserved, and idle
//! sessions are reclaimed automatically.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Egress: terminate tunnels, relay to the echo service on :7.
//! let egress = Egress::bind(egress_config).await?;
//! tokio::spawn(egress.clone().run());
//!
//! // Ingress: accept plaintext datagrams on :10000, tunnel them out.
//! let ingress = Ingress::bind(ingress_config).await?;
//! ingress.clone().run().await?;
//! ```

pub mod activity;
pub mod config;
pub mod egress;
pub mod endpoint;
pub mod ingress;
pub mod payload;
pub mod session_table;

pub use config::{CommonConfig, EgressConfig, IngressConfig, TunnelIdentity};
pub use egress::Egress;
pub use endpoint::{DtlsEndpoint, DtlsListener, EndpointError};
pub use ingress::Ingress;
pub use payload::{Package, Payload, PayloadPool};
pub use session_table::SessionTable;
