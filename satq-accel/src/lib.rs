//! # satq-accel: hardware acceleration offload for the satellite QUIC proxy
//!
//! This crate fronts an FPGA accelerator that offloads the per-packet heavy
//! lifting of the proxy: AEAD crypto, compression, and packet framing. It is
//! organized as three layers, leaves first:
//!
//! ```text
//! satq-accel/
//! ├── device    - ioctl channel to the driver, behind the Device trait
//! ├── buffer    - DMA buffer registry (three address views per buffer)
//! ├── dma       - engine discovery, transfers, completion polling
//! ├── fallback  - byte-compatible CPU implementations of the engines
//! ├── stats     - atomic operation counters
//! └── facade    - the public three-engine Accelerator surface
//! ```
//!
//! The [`Accelerator`] facade serves the same contract whether a card is
//! attached or not: when the device is absent, or simulation mode was
//! requested, operations run on the CPU and produce bit-identical output, so
//! the QUIC layers above never branch on the mode.

pub mod buffer;
pub mod device;
pub mod dma;
pub mod error;
pub mod facade;
pub mod fallback;
pub mod regs;
pub mod stats;

pub use buffer::{BufferManager, DmaBuffer, DMA_BUFFER_ALIGNMENT, MAX_DMA_BUFFERS};
pub use device::{Device, DmaEngineInfo, DmaInfo, FpgaDevice};
pub use dma::{
    DmaController, TransferCallback, TransferDirection, TransferMode, TransferResult,
    MAX_DMA_TRANSFER_SIZE, MIN_DMA_TRANSFER_SIZE,
};
pub use error::{AccelError, Result};
pub use facade::{
    Accelerator, CompressionOp, CryptoOp, OpCallback, OpResult, PacketOp, MAX_AAD_SIZE,
    MAX_KEY_SIZE, MAX_NONCE_SIZE,
};
pub use stats::{AccelStats, StatsSnapshot};
