//! DMA transfer controller.
//!
//! Programs the device's DMA engines to move buffer contents between host
//! and accelerator memory. Engines are claimed by an atomic flip of their
//! busy flag; a claimer that loses tries the next engine. Blocking transfers
//! poll the channel status inline; non-blocking transfers hand the poll to a
//! detached thread that owns the engine until completion and then fires the
//! caller's callback.

use crate::buffer::{BufferManager, DmaBuffer};
use crate::device::{Device, SYNC_DEVICE_TO_HOST, SYNC_HOST_TO_DEVICE};
use crate::error::{AccelError, Result};
use crate::regs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Smallest transfer the engines accept.
pub const MIN_DMA_TRANSFER_SIZE: usize = 64;
/// Largest single transfer (16 MiB).
pub const MAX_DMA_TRANSFER_SIZE: usize = 16 * 1024 * 1024;

/// Interval between channel status polls.
const POLL_INTERVAL: Duration = Duration::from_micros(100);
/// Budget for engine resets and aborts.
const RESET_BUDGET: Duration = Duration::from_millis(100);

/// Per-process monotonic transfer id programmed into `TRANSFER_ID`.
static NEXT_TRANSFER_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl TransferDirection {
    fn sync_code(self) -> u32 {
        match self {
            TransferDirection::HostToDevice => SYNC_HOST_TO_DEVICE,
            TransferDirection::DeviceToHost => SYNC_DEVICE_TO_HOST,
        }
    }

    fn control_bit(self) -> u32 {
        match self {
            TransferDirection::HostToDevice => regs::DMA_CTRL_DIR_H2D,
            TransferDirection::DeviceToHost => regs::DMA_CTRL_DIR_D2H,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Blocking,
    NonBlocking,
}

/// Outcome of one DMA transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub success: bool,
    pub bytes_transferred: u32,
    pub error_code: u32,
    pub error_message: String,
}

impl TransferResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            ..Default::default()
        }
    }
}

/// One-shot consumer of a non-blocking transfer's final result.
pub type TransferCallback = Box<dyn FnOnce(&TransferResult) + Send + 'static>;

struct DmaEngine {
    base_address: u64,
    channel_count: u32,
    busy: AtomicBool,
}

/// Completion slot shared between the submitter and the poller thread.
struct PendingState {
    result: Mutex<Option<TransferResult>>,
    cond: Condvar,
}

impl PendingState {
    fn complete(&self, result: TransferResult) {
        *self.result.lock().unwrap() = Some(result);
        self.cond.notify_all();
    }
}

struct PendingTransfer {
    buffer_id: u32,
    state: Arc<PendingState>,
}

/// High-level interface to the device's DMA engines.
pub struct DmaController {
    device: Arc<dyn Device>,
    buffer_manager: BufferManager,
    engines: Vec<Arc<DmaEngine>>,
    pending: Mutex<Vec<PendingTransfer>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl DmaController {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            buffer_manager: BufferManager::new(device.clone()),
            device,
            engines: Vec::new(),
            pending: Mutex::new(Vec::new()),
            pollers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Discover and reset the device's DMA engines.
    pub fn initialize(&mut self) -> Result<()> {
        self.buffer_manager.initialize()?;

        let info = self.device.dma_info()?;
        if info.engines.is_empty() {
            return Err(AccelError::InvalidArgument("no DMA engines found"));
        }

        let mut engines = Vec::with_capacity(info.engines.len());
        for (index, engine) in info.engines.iter().enumerate() {
            let base = engine.base_address as u32;
            self.device.write_register(
                base + regs::DMA_REG_CONTROL,
                regs::DMA_CTRL_RESET,
            )?;

            let deadline = Instant::now() + RESET_BUDGET;
            loop {
                let status = self.device.read_register(base + regs::DMA_REG_STATUS)?;
                if status & regs::DMA_STATUS_BUSY == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::error!(engine = index, "DMA engine reset timed out");
                    return Err(AccelError::Timeout("DMA engine reset"));
                }
                std::thread::sleep(POLL_INTERVAL);
            }

            engines.push(Arc::new(DmaEngine {
                base_address: engine.base_address,
                channel_count: engine.channel_count,
                busy: AtomicBool::new(false),
            }));
        }

        tracing::info!(engines = engines.len(), "DMA engines initialized");
        self.engines = engines;
        Ok(())
    }

    /// Allocate a DMA buffer suitable for use with [`DmaController::transfer`].
    pub fn allocate_buffer(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 || size > MAX_DMA_TRANSFER_SIZE {
            return Err(AccelError::InvalidArgument("buffer size out of range"));
        }
        self.buffer_manager.allocate(size)
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffer_manager
    }

    /// Run a transfer over the first free engine's channel 0.
    ///
    /// Blocking mode returns the final result. Non-blocking mode returns
    /// `success = true` once the transfer is submitted; the final result is
    /// delivered through `callback` and [`DmaController::wait_for`].
    pub fn transfer(
        &self,
        buffer: &DmaBuffer,
        size: usize,
        direction: TransferDirection,
        mode: TransferMode,
        callback: Option<TransferCallback>,
    ) -> TransferResult {
        if size < MIN_DMA_TRANSFER_SIZE || size > MAX_DMA_TRANSFER_SIZE.min(buffer.size()) {
            return TransferResult::failure("transfer size out of range");
        }

        let Some(engine) = self.claim_engine() else {
            return TransferResult::failure("no available DMA engines");
        };

        let channel_base = channel_base(&engine, 0);
        if let Err(error) = self.program_channel(channel_base, buffer, size, direction) {
            engine.busy.store(false, Ordering::Release);
            return TransferResult::failure(format!("failed to start DMA transfer: {error}"));
        }

        match mode {
            TransferMode::Blocking => {
                let result = poll_channel(
                    self.device.as_ref(),
                    channel_base,
                    &self.shutdown,
                );

                if result.success {
                    let _ = self.synchronize(buffer, direction);
                }
                engine.busy.store(false, Ordering::Release);
                result
            }
            TransferMode::NonBlocking => {
                let state = Arc::new(PendingState {
                    result: Mutex::new(None),
                    cond: Condvar::new(),
                });

                self.pending.lock().unwrap().push(PendingTransfer {
                    buffer_id: buffer.id(),
                    state: state.clone(),
                });

                let device = self.device.clone();
                let shutdown = self.shutdown.clone();
                let buffer = buffer.clone();
                let engine = engine.clone();

                let handle = std::thread::Builder::new()
                    .name("dma-poller".into())
                    .spawn(move || {
                        let result = poll_channel(device.as_ref(), channel_base, &shutdown);

                        if result.success {
                            let _ = device.sync_dma_buffer(
                                buffer.virt_addr(),
                                buffer.size(),
                                direction.sync_code(),
                            );
                        }
                        engine.busy.store(false, Ordering::Release);

                        if let Some(callback) = callback {
                            callback(&result);
                        }
                        state.complete(result);
                    })
                    .expect("spawn dma-poller thread");

                self.pollers.lock().unwrap().push(handle);

                TransferResult {
                    success: true,
                    ..Default::default()
                }
            }
        }
    }

    /// Block until the non-blocking transfer on `buffer` completes.
    /// `timeout_ms == 0` waits without bound. The completed entry is removed
    /// once observed.
    pub fn wait_for(&self, buffer: &DmaBuffer, timeout_ms: u64) -> TransferResult {
        let state = {
            let pending = self.pending.lock().unwrap();
            match pending.iter().find(|t| t.buffer_id == buffer.id()) {
                Some(transfer) => transfer.state.clone(),
                None => {
                    return TransferResult::failure("no pending transfer found for this buffer")
                }
            }
        };

        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        let mut slot = state.result.lock().unwrap();
        let result = loop {
            if let Some(result) = slot.clone() {
                break result;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return TransferResult::failure(
                            "timeout waiting for transfer completion",
                        );
                    }
                    let (guard, _) = state.cond.wait_timeout(slot, deadline - now).unwrap();
                    slot = guard;
                }
                None => {
                    slot = state.cond.wait(slot).unwrap();
                }
            }
        };
        drop(slot);

        self.pending
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(&t.state, &state));
        result
    }

    /// True if no transfer is pending for the buffer or the pending transfer
    /// has completed. A buffer that was never submitted reports complete.
    pub fn is_complete(&self, buffer: &DmaBuffer) -> bool {
        let pending = self.pending.lock().unwrap();
        match pending.iter().find(|t| t.buffer_id == buffer.id()) {
            Some(transfer) => transfer.state.result.lock().unwrap().is_some(),
            None => true,
        }
    }

    /// Flush or invalidate the buffer for the given direction.
    pub fn synchronize(&self, buffer: &DmaBuffer, direction: TransferDirection) -> Result<()> {
        self.device
            .sync_dma_buffer(buffer.virt_addr(), buffer.size(), direction.sync_code())
    }

    fn claim_engine(&self) -> Option<Arc<DmaEngine>> {
        for engine in &self.engines {
            if engine
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(engine.clone());
            }
        }
        None
    }

    fn program_channel(
        &self,
        channel_base: u32,
        buffer: &DmaBuffer,
        size: usize,
        direction: TransferDirection,
    ) -> Result<()> {
        let host = buffer.phys_addr();
        let device_addr = buffer.device_addr();
        let (src, dst) = match direction {
            TransferDirection::HostToDevice => (host, device_addr),
            TransferDirection::DeviceToHost => (device_addr, host),
        };

        let dev = self.device.as_ref();
        dev.write_register(channel_base + regs::DMA_REG_SRC_ADDR_LOW, src as u32)?;
        dev.write_register(channel_base + regs::DMA_REG_SRC_ADDR_HIGH, (src >> 32) as u32)?;
        dev.write_register(channel_base + regs::DMA_REG_DST_ADDR_LOW, dst as u32)?;
        dev.write_register(channel_base + regs::DMA_REG_DST_ADDR_HIGH, (dst >> 32) as u32)?;
        dev.write_register(channel_base + regs::DMA_REG_TRANSFER_SIZE, size as u32)?;

        let transfer_id = NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed);
        dev.write_register(channel_base + regs::DMA_REG_TRANSFER_ID, transfer_id)?;

        dev.write_register(
            channel_base + regs::DMA_REG_CONTROL,
            regs::DMA_CTRL_START | regs::DMA_CTRL_IRQ_EN | direction.control_bit(),
        )?;

        tracing::trace!(transfer_id, size, ?direction, "DMA transfer started");
        Ok(())
    }

    fn abort_channel(&self, channel_base: u32) {
        if self
            .device
            .write_register(channel_base + regs::DMA_REG_CONTROL, regs::DMA_CTRL_ABORT)
            .is_err()
        {
            return;
        }

        let deadline = Instant::now() + RESET_BUDGET;
        loop {
            match self.device.read_register(channel_base + regs::DMA_REG_STATUS) {
                Ok(status) if status & regs::DMA_STATUS_BUSY == 0 => break,
                Ok(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                _ => {
                    tracing::warn!(channel_base, "timeout waiting for DMA abort");
                    break;
                }
            }
        }
    }
}

impl Drop for DmaController {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let has_incomplete = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.state.result.lock().unwrap().is_none());

        if has_incomplete {
            for engine in &self.engines {
                for channel in 0..engine.channel_count {
                    self.abort_channel(channel_base(engine, channel));
                }
            }
        }

        let pollers = std::mem::take(&mut *self.pollers.lock().unwrap());
        for handle in pollers {
            let _ = handle.join();
        }

        for engine in &self.engines {
            let base = engine.base_address as u32;
            let _ = self
                .device
                .write_register(base + regs::DMA_REG_CONTROL, regs::DMA_CTRL_RESET);
        }
    }
}

fn channel_base(engine: &DmaEngine, channel: u32) -> u32 {
    (engine.base_address + channel as u64 * regs::DMA_CHANNEL_STRIDE) as u32
}

/// Poll a channel's STATUS until DONE or ERROR. The shutdown flag turns an
/// in-flight poll into an aborted result so detached pollers can exit when
/// the controller is torn down.
fn poll_channel(device: &dyn Device, channel_base: u32, shutdown: &AtomicBool) -> TransferResult {
    loop {
        let status = match device.read_register(channel_base + regs::DMA_REG_STATUS) {
            Ok(status) => status,
            Err(error) => {
                return TransferResult::failure(format!("failed to read DMA status: {error}"))
            }
        };

        if status & regs::DMA_STATUS_ERROR != 0 {
            let error_code = device
                .read_register(channel_base + regs::DMA_REG_ERROR_CODE)
                .unwrap_or(0);
            return TransferResult {
                success: false,
                bytes_transferred: 0,
                error_code,
                error_message: "DMA transfer failed".into(),
            };
        }

        if status & regs::DMA_STATUS_DONE != 0 {
            let bytes = device
                .read_register(channel_base + regs::DMA_REG_TRANSFERRED_BYTES)
                .unwrap_or(0);
            return TransferResult {
                success: true,
                bytes_transferred: bytes,
                error_code: 0,
                error_message: String::new(),
            };
        }

        if shutdown.load(Ordering::SeqCst) {
            return TransferResult::failure("transfer aborted");
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
