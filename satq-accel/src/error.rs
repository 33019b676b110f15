//! Error types for device, DMA, and accelerator operations.

use thiserror::Error;

/// Errors surfaced by the acceleration stack.
#[derive(Debug, Error)]
pub enum AccelError {
    /// A caller-supplied argument was rejected before touching the device.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Key, nonce, or AAD exceeded the device's limits.
    #[error("operand too large: {0}")]
    OperandTooLarge(&'static str),

    /// All DMA engines are claimed by in-flight transfers.
    #[error("no available DMA engines")]
    NoEngineAvailable,

    /// The buffer registry is at capacity or the manager rejected the request.
    #[error("buffer allocation failed: {0}")]
    BufferAllocation(&'static str),

    /// A polling budget was exhausted before the device signalled completion.
    #[error("device timeout: {0}")]
    Timeout(&'static str),

    /// The device's STATUS register reported an error; the code comes from
    /// its ERROR_CODE register.
    #[error("device error (code {0:#x})")]
    Device(u32),

    /// An ioctl against the device handle failed.
    #[error("device I/O failed during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// AEAD tag verification failed during the decrypt fallback.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Compressed input did not start with the expected frame header.
    #[error("invalid compression format")]
    InvalidCompressionFormat,

    /// The component was used before a successful `initialize()`.
    #[error("not initialized")]
    NotInitialized,
}

impl AccelError {
    /// Numeric code reported through `OpResult::error_code`.
    pub fn code(&self) -> u32 {
        match self {
            AccelError::InvalidArgument(_) => 1,
            AccelError::OperandTooLarge(_) => 2,
            AccelError::NoEngineAvailable => 3,
            AccelError::BufferAllocation(_) => 4,
            AccelError::Timeout(_) => 5,
            AccelError::Device(code) => *code,
            AccelError::Io { .. } => 6,
            AccelError::AuthenticationFailed => 7,
            AccelError::InvalidCompressionFormat => 8,
            AccelError::NotInitialized => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_carries_code() {
        assert_eq!(AccelError::Device(0x42).code(), 0x42);
        assert_eq!(AccelError::InvalidArgument("x").code(), 1);
        assert_eq!(AccelError::OperandTooLarge("x").code(), 2);
    }
}
