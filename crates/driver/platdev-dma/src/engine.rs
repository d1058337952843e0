//! The DMA engine: buffer allocation, mapping, and cache maintenance.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use platdev_core::config::DmaConfig;
use platdev_core::event::{Event, EventKind, EventSink};
use platdev_core::id::DeviceId;
use platdev_core::sync::{CompletionSignal, WaitOutcome};

use crate::DmaError;
use crate::buffer::{CoherentBuffer, DmaMemory, ScatterGatherList, Segment, SgEntry, StreamingBuffer};
use crate::mapping::{DevicePort, DmaDirection, MappingTable};
use crate::memory::SystemMemory;
use crate::pool::{DmaPool, PoolBuffer};
use crate::region::align_up;

pub(crate) struct EngineInner {
    pub(crate) memory: SystemMemory,
    pub(crate) mappings: Mutex<MappingTable>,
    events: Arc<dyn EventSink>,
    page_size: u64,
}

/// Allocates DMA memory and maps it for devices.
///
/// Cloning is cheap; clones share memory and mappings. A clone obtained with
/// [`for_device`](Self::for_device) attributes its events to that device.
#[derive(Clone)]
pub struct DmaEngine {
    inner: Arc<EngineInner>,
    device: Option<DeviceId>,
}

impl core::fmt::Debug for DmaEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaEngine")
            .field("device", &self.device)
            .field("memory", &self.inner.memory)
            .field("active_mappings", &self.active_mappings())
            .finish()
    }
}

impl DmaEngine {
    /// Creates an engine over fresh system memory.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidConfig`] for an unusable memory or page layout.
    pub fn new(config: &DmaConfig, events: Arc<dyn EventSink>) -> Result<Self, DmaError> {
        if !config.page_size.is_power_of_two() {
            return Err(DmaError::InvalidConfig("page size must be a power of two"));
        }
        if config.mask_bits == 0 {
            return Err(DmaError::InvalidConfig("mask must cover at least one bit"));
        }
        let memory = SystemMemory::new(config)?;
        let mappings = MappingTable::new(config.mask());
        log::debug!(target: "platdev::dma", "engine ready, mask {:#x}", mappings.mask());
        Ok(Self {
            inner: Arc::new(EngineInner {
                memory,
                mappings: Mutex::new(mappings),
                events,
                page_size: config.page_size,
            }),
            device: None,
        })
    }

    /// Returns a handle that attributes events to `device`.
    #[must_use]
    pub fn for_device(&self, device: DeviceId) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            device: Some(device),
        }
    }

    /// Device events are attributed to, if any.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// The system memory behind the engine.
    #[must_use]
    pub fn memory(&self) -> &SystemMemory {
        &self.inner.memory
    }

    /// The device side of the bus.
    #[must_use]
    pub fn device_port(&self) -> DevicePort {
        DevicePort::new(Arc::clone(&self.inner))
    }

    /// Highest device address the engine maps to.
    #[must_use]
    pub fn mask(&self) -> u64 {
        self.inner.mappings.lock().mask()
    }

    /// Number of live device mappings.
    #[must_use]
    pub fn active_mappings(&self) -> usize {
        self.inner.mappings.lock().len()
    }

    // ---- Coherent buffers -----------------------------------------------------

    /// Allocates a page-aligned buffer mapped for the device in both
    /// directions until it is freed.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidSegment`] for a zero length,
    /// [`DmaError::OutOfMemory`], or any mapping error.
    pub fn alloc_coherent(&self, len: u64) -> Result<CoherentBuffer, DmaError> {
        self.alloc_coherent_aligned(len, self.inner.page_size)
    }

    fn alloc_coherent_aligned(&self, len: u64, align: u64) -> Result<CoherentBuffer, DmaError> {
        if len == 0 {
            return Err(DmaError::InvalidSegment { addr: 0, len });
        }
        let memory = &self.inner.memory;
        let addr = memory.allocate(len, align.max(self.inner.page_size))?;
        let mapped = self
            .inner
            .mappings
            .lock()
            .map(addr, len, DmaDirection::Bidirectional);
        match mapped {
            Ok((id, dev)) => {
                log::trace!(
                    target: "platdev::dma",
                    "coherent buffer {addr:#x}+{len:#x} -> device {dev:#x}"
                );
                Ok(CoherentBuffer::new(Arc::clone(&self.inner), addr, dev, len, id))
            }
            Err(err) => {
                memory.deallocate(addr, len);
                Err(err)
            }
        }
    }

    /// Unmaps and frees a coherent buffer. Same as dropping it.
    pub fn free_coherent(&self, buf: CoherentBuffer) {
        drop(buf);
    }

    /// Allocates cached, line-aligned memory for streaming transfers.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidSegment`] for a zero length,
    /// [`DmaError::OutOfMemory`].
    pub fn alloc_streaming(&self, len: u64) -> Result<StreamingBuffer, DmaError> {
        if len == 0 {
            return Err(DmaError::InvalidSegment { addr: 0, len });
        }
        let line = self.inner.memory.line_size() as u64;
        let addr = self.inner.memory.allocate(len, line)?;
        Ok(StreamingBuffer::new(Arc::clone(&self.inner), addr, len))
    }

    // ---- Scatter-gather -------------------------------------------------------

    /// Maps `segments` for one transfer and syncs them for the device.
    ///
    /// All or nothing: if a segment after the first fails, the segments
    /// already mapped are unmapped again, a
    /// [`PartialMapFailure`](EventKind::PartialMapFailure) event is emitted
    /// and [`DmaError::PartialMapFailure`] is returned.
    ///
    /// # Errors
    ///
    /// [`DmaError::EmptyScatterList`], [`DmaError::PartialMapFailure`], or
    /// the mapping error of the first segment.
    pub fn map_sg(
        &self,
        segments: &[Segment],
        direction: DmaDirection,
    ) -> Result<ScatterGatherList, DmaError> {
        if segments.is_empty() {
            return Err(DmaError::EmptyScatterList);
        }
        let mut entries = Vec::with_capacity(segments.len());
        let mut table = self.inner.mappings.lock();
        for (index, &segment) in segments.iter().enumerate() {
            match self.map_segment(&mut table, segment, direction) {
                Ok((map_id, dev_addr)) => entries.push(SgEntry {
                    segment,
                    dev_addr,
                    map_id,
                }),
                Err(cause) => {
                    for entry in entries.iter().rev() {
                        table.unmap(entry.map_id);
                    }
                    drop(table);
                    let unmapped = entries.len();
                    self.emit(
                        EventKind::PartialMapFailure,
                        format!("segment {index} of {}: {cause}; unmapped {unmapped}", segments.len()),
                    );
                    return Err(DmaError::PartialMapFailure {
                        index,
                        unmapped,
                        cause: Box::new(cause),
                    });
                }
            }
        }
        drop(table);

        let list = ScatterGatherList::new(Arc::clone(&self.inner), entries, direction);
        self.sync_for_device(&list, direction)?;
        log::trace!(
            target: "platdev::dma",
            "mapped {} segments ({} bytes) {direction:?}",
            list.len(),
            list.total_len()
        );
        Ok(list)
    }

    fn map_segment(
        &self,
        table: &mut MappingTable,
        segment: Segment,
        direction: DmaDirection,
    ) -> Result<(u64, u64), DmaError> {
        if segment.len == 0 || !self.inner.memory.contains(segment.addr, segment.len) {
            return Err(DmaError::InvalidSegment {
                addr: segment.addr,
                len: segment.len,
            });
        }
        table.map(segment.addr, segment.len, direction)
    }

    /// Syncs a list for the CPU and unmaps it.
    ///
    /// A `direction` different from the one the list was mapped with is
    /// logged and ignored.
    ///
    /// # Errors
    ///
    /// Propagates a sync failure; the list is unmapped regardless.
    pub fn unmap_sg(&self, list: ScatterGatherList, direction: DmaDirection) -> Result<(), DmaError> {
        if direction != list.direction() {
            log::warn!(
                target: "platdev::dma",
                "unmap_sg: list mapped {:?}, unmapped {direction:?}",
                list.direction()
            );
        }
        let synced = self.sync_for_cpu(&list, list.direction());
        drop(list);
        synced
    }

    // ---- Cache maintenance ----------------------------------------------------

    /// Makes CPU writes visible to the device (clean) or discards lines the
    /// device is about to overwrite (invalidate).
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidSegment`] if the buffer lies outside RAM.
    pub fn sync_for_device<B>(&self, buf: &B, direction: DmaDirection) -> Result<(), DmaError>
    where
        B: DmaMemory + ?Sized,
    {
        if self.inner.memory.is_coherent() || buf.is_coherent() {
            return Ok(());
        }
        for segment in buf.cpu_segments() {
            match direction {
                DmaDirection::ToDevice | DmaDirection::Bidirectional => {
                    self.inner.memory.clean(segment.addr, segment.len)?;
                }
                DmaDirection::FromDevice => {
                    self.inner.memory.invalidate(segment.addr, segment.len)?;
                }
            }
        }
        Ok(())
    }

    /// Makes device writes visible to the CPU.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidSegment`] if the buffer lies outside RAM.
    pub fn sync_for_cpu<B>(&self, buf: &B, direction: DmaDirection) -> Result<(), DmaError>
    where
        B: DmaMemory + ?Sized,
    {
        if self.inner.memory.is_coherent() || buf.is_coherent() || !direction.device_writes() {
            return Ok(());
        }
        for segment in buf.cpu_segments() {
            self.inner.memory.invalidate(segment.addr, segment.len)?;
        }
        Ok(())
    }

    // ---- Pools ----------------------------------------------------------------

    /// Creates a pool of `block_count` blocks of `block_size` bytes, each
    /// aligned to `alignment`, carved from one coherent region.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidPool`] for a zero size or count or a bad
    /// alignment, otherwise the error from allocating the region.
    pub fn pool_create(
        &self,
        name: &str,
        block_size: u64,
        alignment: u64,
        block_count: usize,
    ) -> Result<DmaPool, DmaError> {
        if block_size == 0 {
            return Err(DmaError::InvalidPool("block size must be non-zero"));
        }
        if block_count == 0 {
            return Err(DmaError::InvalidPool("block count must be non-zero"));
        }
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(DmaError::InvalidPool("alignment must be a power of two"));
        }
        let count = u32::try_from(block_count)
            .map_err(|_| DmaError::InvalidPool("block count too large"))?;
        let stride = align_up(block_size, alignment)
            .ok_or(DmaError::InvalidPool("block size too large"))?;
        let total = stride
            .checked_mul(u64::from(count))
            .ok_or(DmaError::InvalidPool("pool too large"))?;

        let region = self.alloc_coherent_aligned(total, alignment)?;
        log::debug!(
            target: "platdev::dma",
            "pool {name}: {count} x {block_size} bytes (stride {stride}) at device {:#x}",
            region.device_addr()
        );
        Ok(DmaPool::new(name, block_size, stride, count, region))
    }

    /// Takes a block from `pool`.
    ///
    /// # Errors
    ///
    /// [`DmaError::PoolExhausted`], [`DmaError::PoolDestroyed`].
    pub fn pool_alloc(&self, pool: &DmaPool) -> Result<PoolBuffer, DmaError> {
        pool.alloc()
    }

    /// Returns a block to `pool`.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidPool`] if `buf` came from another pool; the block
    /// still goes back to its own pool.
    pub fn pool_free(&self, pool: &DmaPool, buf: PoolBuffer) -> Result<(), DmaError> {
        if !buf.belongs_to(pool) {
            return Err(DmaError::InvalidPool("buffer belongs to another pool"));
        }
        drop(buf);
        Ok(())
    }

    /// Destroys `pool`, freeing its region.
    ///
    /// # Errors
    ///
    /// [`DmaError::PoolNotEmpty`] while blocks are checked out.
    pub fn pool_destroy(&self, pool: &DmaPool) -> Result<(), DmaError> {
        pool.destroy()
    }

    // ---- Completion -----------------------------------------------------------

    /// Waits for a transfer to complete, at most `timeout`.
    pub fn wait(&self, signal: &CompletionSignal, timeout: Duration) -> WaitOutcome {
        let outcome = signal.wait(timeout);
        if outcome != WaitOutcome::Completed {
            log::debug!(target: "platdev::dma", "wait ended {outcome:?} after {timeout:?}");
        }
        outcome
    }

    fn emit(&self, kind: EventKind, message: String) {
        self.inner
            .events
            .emit(Event::new(kind, message).with_device(self.device));
    }
}
