//! Error types for QUIC packet handling.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("invalid packet type")]
    InvalidPacketType,

    /// Token or payload length fields longer than one byte are not decoded;
    /// the packet is dropped rather than misparsed.
    #[error("multi-byte variable-length integer not supported")]
    VarIntTooLong,

    #[error("unsupported packet type for sending")]
    UnsupportedSendType,
}

pub type Result<T> = std::result::Result<T, PacketError>;
