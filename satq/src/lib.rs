//! Satellite QUIC proxy with hardware acceleration offload.
//!
//! The binary wires three pieces together: the [`satq_accel::Accelerator`]
//! facade (hardware or simulation), the per-client QUIC handlers from
//! `satq-quic`, and the UDP dispatcher in [`proxy`].

pub mod config;
pub mod proxy;
pub mod telemetry;

pub use config::ProxyConfig;
pub use proxy::{QuicProxy, MAX_DATAGRAM_SIZE};
