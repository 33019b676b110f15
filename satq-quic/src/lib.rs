//! # satq-quic: QUIC handling for the satellite proxy
//!
//! A deliberately narrow QUIC implementation: enough of RFC 9000 to
//! terminate client traffic over a high-latency link and hand the per-packet
//! heavy lifting to the acceleration layer. Variable-length integers are
//! truncated to their 1-byte form, packet numbers ride as 4 bytes, and
//! 0-RTT / Retry / Version Negotiation are recognized but not served.
//!
//! ```text
//! satq-quic/
//! ├── error       - header parse errors
//! ├── frames      - frame type constants and classification
//! ├── packet      - long/short header parsing and construction
//! └── connection  - per-client handler: dispatch, ACK, retransmission
//! ```

pub mod connection;
pub mod error;
pub mod frames;
pub mod packet;

pub use connection::{ConnectionHandler, IDLE_TIMEOUT, RETRANSMIT_TIMEOUT};
pub use error::{PacketError, Result};
pub use frames::FrameKind;
pub use packet::{parse_packet, build_packet, PacketHeader, PacketType, QUIC_VERSION_1};
