//! Device channel to the FPGA accelerator.
//!
//! All traffic to the card goes through a character device: register pokes,
//! DMA buffer allocation, and cache synchronization are each one ioctl. The
//! [`Device`] trait keeps that surface pluggable so the DMA layers can be
//! driven against an in-memory device in tests, the same seam the crypto
//! backends use elsewhere in this workspace.

use crate::error::{AccelError, Result};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

// Driver ioctl request codes, named by their semantic operation.
pub const IOCTL_WRITE_REGISTER: libc::c_ulong = 0x1000;
pub const IOCTL_READ_REGISTER: libc::c_ulong = 0x1001;
pub const IOCTL_GET_DMA_INFO: libc::c_ulong = 0x2000;
pub const IOCTL_MAP_DMA_REGION: libc::c_ulong = 0x2001;
pub const IOCTL_UNMAP_DMA_REGION: libc::c_ulong = 0x2002;
pub const IOCTL_SYNC_DMA_BUFFER: libc::c_ulong = 0x2003;
pub const IOCTL_ALLOC_DMA_BUFFER: libc::c_ulong = 0x2004;
pub const IOCTL_FREE_DMA_BUFFER: libc::c_ulong = 0x2005;

/// Maximum number of DMA engines a device can report.
pub const MAX_DMA_ENGINES: usize = 4;

/// Buffer-to-device synchronization direction (`SYNC_DMA_BUFFER` argument).
pub const SYNC_HOST_TO_DEVICE: u32 = 0;
pub const SYNC_DEVICE_TO_HOST: u32 = 1;

/// One DMA engine as reported by `GET_DMA_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaEngineInfo {
    /// Base address of the engine's register bank.
    pub base_address: u64,
    /// Number of channels (256-byte register strides) within the engine.
    pub channel_count: u32,
}

/// DMA topology reported by the device at initialization time.
#[derive(Debug, Clone, Default)]
pub struct DmaInfo {
    pub engines: Vec<DmaEngineInfo>,
}

/// The three parallel addresses of a freshly allocated DMA buffer.
#[derive(Debug, Clone, Copy)]
pub struct DmaAllocation {
    /// Host-virtual address for CPU access.
    pub virt: u64,
    /// Host-physical address used as DMA source/sink.
    pub phys: u64,
    /// Address of the buffer as seen from the device.
    pub device: u64,
}

/// Operations the acceleration stack needs from the driver.
pub trait Device: Send + Sync {
    /// Query DMA engine topology (`GET_DMA_INFO`).
    fn dma_info(&self) -> Result<DmaInfo>;

    /// Allocate a DMA-addressable buffer of `size` bytes (`ALLOC_DMA_BUFFER`).
    fn alloc_dma_buffer(&self, size: usize) -> Result<DmaAllocation>;

    /// Release a buffer previously returned by [`Device::alloc_dma_buffer`].
    fn free_dma_buffer(&self, virt: u64, size: usize) -> Result<()>;

    /// Flush or invalidate caches for the buffer (`SYNC_DMA_BUFFER`).
    /// `direction` is [`SYNC_HOST_TO_DEVICE`] or [`SYNC_DEVICE_TO_HOST`].
    fn sync_dma_buffer(&self, virt: u64, size: usize, direction: u32) -> Result<()>;

    /// Write a 32-bit device register.
    fn write_register(&self, address: u32, value: u32) -> Result<()>;

    /// Read a 32-bit device register.
    fn read_register(&self, address: u32) -> Result<u32>;
}

// ============================================================================
// ioctl argument layouts (must match the driver ABI)
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
struct RawEngineInfo {
    base_address: u64,
    channel_count: u32,
}

#[repr(C)]
struct RawDmaInfo {
    count: u32,
    engines: [RawEngineInfo; MAX_DMA_ENGINES],
}

#[repr(C)]
struct RawAllocParams {
    size: libc::size_t,
    virt: u64,
    phys: u64,
    device: u64,
}

#[repr(C)]
struct RawFreeParams {
    virt: u64,
    size: libc::size_t,
}

#[repr(C)]
struct RawSyncParams {
    virt: u64,
    size: libc::size_t,
    direction: libc::c_int,
}

#[repr(C)]
struct RawRegisterAccess {
    address: u32,
    value: u32,
}

/// Character-device-backed implementation of [`Device`].
pub struct FpgaDevice {
    path: PathBuf,
    file: File,
}

impl FpgaDevice {
    /// Open the device node read-write.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| AccelError::Io {
                op: "open device",
                source,
            })?;

        tracing::debug!(device = %path.display(), "FPGA device opened");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T, op: &'static str) -> Result<()> {
        // The driver contract for every request in this module is a single
        // pointer-to-struct argument.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request, arg as *mut T) };
        if ret < 0 {
            return Err(AccelError::Io {
                op,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Device for FpgaDevice {
    fn dma_info(&self) -> Result<DmaInfo> {
        let mut raw = RawDmaInfo {
            count: 0,
            engines: [RawEngineInfo {
                base_address: 0,
                channel_count: 0,
            }; MAX_DMA_ENGINES],
        };

        self.ioctl(IOCTL_GET_DMA_INFO, &mut raw, "GET_DMA_INFO")?;

        let count = (raw.count as usize).min(MAX_DMA_ENGINES);
        let engines = raw.engines[..count]
            .iter()
            .map(|e| DmaEngineInfo {
                base_address: e.base_address,
                channel_count: e.channel_count,
            })
            .collect();

        Ok(DmaInfo { engines })
    }

    fn alloc_dma_buffer(&self, size: usize) -> Result<DmaAllocation> {
        let mut raw = RawAllocParams {
            size,
            virt: 0,
            phys: 0,
            device: 0,
        };

        self.ioctl(IOCTL_ALLOC_DMA_BUFFER, &mut raw, "ALLOC_DMA_BUFFER")?;

        Ok(DmaAllocation {
            virt: raw.virt,
            phys: raw.phys,
            device: raw.device,
        })
    }

    fn free_dma_buffer(&self, virt: u64, size: usize) -> Result<()> {
        let mut raw = RawFreeParams { virt, size };
        self.ioctl(IOCTL_FREE_DMA_BUFFER, &mut raw, "FREE_DMA_BUFFER")
    }

    fn sync_dma_buffer(&self, virt: u64, size: usize, direction: u32) -> Result<()> {
        let mut raw = RawSyncParams {
            virt,
            size,
            direction: direction as libc::c_int,
        };
        self.ioctl(IOCTL_SYNC_DMA_BUFFER, &mut raw, "SYNC_DMA_BUFFER")
    }

    fn write_register(&self, address: u32, value: u32) -> Result<()> {
        let mut raw = RawRegisterAccess { address, value };
        self.ioctl(IOCTL_WRITE_REGISTER, &mut raw, "WRITE_REGISTER")
    }

    fn read_register(&self, address: u32) -> Result<u32> {
        let mut raw = RawRegisterAccess { address, value: 0 };
        self.ioctl(IOCTL_READ_REGISTER, &mut raw, "READ_REGISTER")?;
        Ok(raw.value)
    }
}

// ============================================================================
// In-memory device for unit tests
// ============================================================================
