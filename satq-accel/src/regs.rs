//! Register maps for the accelerator and its DMA engines.
//!
//! Offsets and bit assignments are fixed by the device's memory map. DMA
//! channel registers are relative to `engine_base + channel * CHANNEL_STRIDE`;
//! accelerator registers are absolute.

// ============================================================================
// DMA channel registers (offsets from the channel base)
// ============================================================================

pub const DMA_REG_CONTROL: u32 = 0x00;
pub const DMA_REG_STATUS: u32 = 0x04;
pub const DMA_REG_SRC_ADDR_LOW: u32 = 0x08;
pub const DMA_REG_SRC_ADDR_HIGH: u32 = 0x0C;
pub const DMA_REG_DST_ADDR_LOW: u32 = 0x10;
pub const DMA_REG_DST_ADDR_HIGH: u32 = 0x14;
pub const DMA_REG_TRANSFER_SIZE: u32 = 0x18;
pub const DMA_REG_TRANSFER_ID: u32 = 0x1C;
pub const DMA_REG_TRANSFERRED_BYTES: u32 = 0x20;
pub const DMA_REG_ERROR_CODE: u32 = 0x24;

/// Register bank stride between channels within one engine.
pub const DMA_CHANNEL_STRIDE: u64 = 0x100;

// DMA control register bits.
pub const DMA_CTRL_START: u32 = 0x0000_0001;
pub const DMA_CTRL_ABORT: u32 = 0x0000_0002;
pub const DMA_CTRL_RESET: u32 = 0x0000_0004;
pub const DMA_CTRL_IRQ_EN: u32 = 0x0000_0008;
pub const DMA_CTRL_DIR_H2D: u32 = 0x0000_0000;
pub const DMA_CTRL_DIR_D2H: u32 = 0x0000_0010;
pub const DMA_CTRL_SYNC: u32 = 0x0000_0020;

// DMA status register bits.
pub const DMA_STATUS_BUSY: u32 = 0x0000_0001;
pub const DMA_STATUS_DONE: u32 = 0x0000_0002;
pub const DMA_STATUS_ERROR: u32 = 0x0000_0004;
pub const DMA_STATUS_IRQ: u32 = 0x0000_0008;

// ============================================================================
// Accelerator registers (absolute offsets)
// ============================================================================

pub const REG_CONTROL: u32 = 0x0000;
pub const REG_STATUS: u32 = 0x0004;
pub const REG_MODULE_SELECT: u32 = 0x0008;
pub const REG_OP_TYPE: u32 = 0x000C;
pub const REG_DATA_ADDR: u32 = 0x0010;
pub const REG_DATA_SIZE: u32 = 0x0014;
pub const REG_KEY_ADDR: u32 = 0x0018;
pub const REG_KEY_SIZE: u32 = 0x001C;
pub const REG_NONCE_ADDR: u32 = 0x0020;
pub const REG_AAD_ADDR: u32 = 0x0024;
pub const REG_AAD_SIZE: u32 = 0x0028;
pub const REG_RESULT_ADDR: u32 = 0x002C;
pub const REG_RESULT_SIZE: u32 = 0x0030;
pub const REG_CONNECTION_ID_HIGH: u32 = 0x0034;
pub const REG_CONNECTION_ID_LOW: u32 = 0x0038;
pub const REG_PACKET_NUMBER: u32 = 0x003C;
/// Processing time, reported by the device in microseconds.
pub const REG_PROCESSING_TIME: u32 = 0x0040;
pub const REG_ERROR_CODE: u32 = 0x0044;

// Accelerator control register bits.
pub const CTRL_START: u32 = 0x0000_0001;
pub const CTRL_RESET: u32 = 0x0000_0002;
pub const CTRL_IRQ_ENABLE: u32 = 0x0000_0004;

// Accelerator status register bits.
pub const STATUS_BUSY: u32 = 0x0000_0001;
pub const STATUS_DONE: u32 = 0x0000_0002;
pub const STATUS_ERROR: u32 = 0x0000_0004;
pub const STATUS_OVERFLOW: u32 = 0x0000_0008;
pub const STATUS_UNDERFLOW: u32 = 0x0000_0010;
pub const STATUS_IRQ: u32 = 0x0000_0020;

// Module select values.
pub const MODULE_CRYPTO: u32 = 0x0000_0001;
pub const MODULE_COMPRESSION: u32 = 0x0000_0002;
pub const MODULE_PACKET: u32 = 0x0000_0004;

// Operation codes, per module.
pub const OP_CRYPTO_ENCRYPT: u32 = 0x0000_0001;
pub const OP_CRYPTO_DECRYPT: u32 = 0x0000_0002;
pub const OP_COMPRESS: u32 = 0x0000_0001;
pub const OP_DECOMPRESS: u32 = 0x0000_0002;
pub const OP_PACKET_FRAME: u32 = 0x0000_0001;
pub const OP_PACKET_ACK: u32 = 0x0000_0002;
pub const OP_PACKET_RETRANSMIT: u32 = 0x0000_0003;
