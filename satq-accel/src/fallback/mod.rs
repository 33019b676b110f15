//! Software implementations of the three accelerator engines.
//!
//! Used when the device is absent or simulation is requested. Outputs are
//! byte-compatible with the hardware engines so downstream state machines do
//! not care which path produced them.

pub mod crypto;
pub mod packet;
pub mod rle;
