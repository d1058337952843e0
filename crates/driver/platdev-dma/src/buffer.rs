//! DMA buffers.
//!
//! Every buffer gives its memory (and device mapping) back when dropped.

use std::sync::Arc;

use crate::DmaError;
use crate::engine::EngineInner;
use crate::mapping::DmaDirection;

/// A contiguous range of system memory, by CPU physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Segment {
    /// Creates a segment.
    #[must_use]
    pub const fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }
}

/// Memory that can take part in a DMA sync.
pub trait DmaMemory {
    /// The CPU ranges backing the buffer.
    fn cpu_segments(&self) -> Vec<Segment>;

    /// `true` if the CPU accesses the buffer uncached, making syncs no-ops.
    fn is_coherent(&self) -> bool;
}

pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), DmaError> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DmaError::OutOfBounds { offset, len }),
    }
}

// ---- Coherent ---------------------------------------------------------------

/// Memory mapped for the device for its whole lifetime and accessed uncached
/// by the CPU.
pub struct CoherentBuffer {
    inner: Arc<EngineInner>,
    cpu_addr: u64,
    dev_addr: u64,
    len: u64,
    map_id: u64,
    live: bool,
}

impl core::fmt::Debug for CoherentBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoherentBuffer")
            .field("cpu_addr", &format_args!("{:#x}", self.cpu_addr))
            .field("dev_addr", &format_args!("{:#x}", self.dev_addr))
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl CoherentBuffer {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        cpu_addr: u64,
        dev_addr: u64,
        len: u64,
        map_id: u64,
    ) -> Self {
        Self {
            inner,
            cpu_addr,
            dev_addr,
            len,
            map_id,
            live: true,
        }
    }

    /// CPU physical address.
    #[must_use]
    pub fn cpu_addr(&self) -> u64 {
        self.cpu_addr
    }

    /// Address the device uses.
    #[must_use]
    pub fn device_addr(&self) -> u64 {
        self.dev_addr
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always `false`; zero-length buffers cannot be allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads from the buffer.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] past the end of the buffer.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        check_bounds(offset, buf.len(), self.len)?;
        self.inner.memory.read_uncached(self.cpu_addr + offset, buf)
    }

    /// Writes to the buffer. Immediately visible to the device.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] past the end of the buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DmaError> {
        check_bounds(offset, data.len(), self.len)?;
        self.inner.memory.write_uncached(self.cpu_addr + offset, data)
    }

    pub(crate) fn release(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        self.inner.mappings.lock().unmap(self.map_id);
        self.inner.memory.deallocate(self.cpu_addr, self.len);
        log::trace!(target: "platdev::dma", "freed coherent buffer at {:#x}", self.cpu_addr);
    }
}

impl DmaMemory for CoherentBuffer {
    fn cpu_segments(&self) -> Vec<Segment> {
        vec![Segment::new(self.cpu_addr, self.len)]
    }

    fn is_coherent(&self) -> bool {
        true
    }
}

impl Drop for CoherentBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

// ---- Streaming --------------------------------------------------------------

/// Ordinary cached memory, mapped for the device per transfer with
/// [`DmaEngine::map_sg`](crate::DmaEngine::map_sg).
///
/// The buffer must outlive any scatter-gather list built from it.
pub struct StreamingBuffer {
    inner: Arc<EngineInner>,
    addr: u64,
    len: u64,
}

impl core::fmt::Debug for StreamingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamingBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl StreamingBuffer {
    pub(crate) fn new(inner: Arc<EngineInner>, addr: u64, len: u64) -> Self {
        Self { inner, addr, len }
    }

    /// CPU physical address.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always `false`; zero-length buffers cannot be allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole buffer as one segment.
    #[must_use]
    pub fn segment(&self) -> Segment {
        Segment::new(self.addr, self.len)
    }

    /// A sub-range of the buffer as a segment.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] if the range leaves the buffer.
    pub fn slice(&self, offset: u64, len: u64) -> Result<Segment, DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(Segment::new(self.addr + offset, len)),
            _ => Err(DmaError::OutOfBounds {
                offset,
                len,
            }),
        }
    }

    /// Reads through the CPU cache.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] past the end of the buffer.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        check_bounds(offset, buf.len(), self.len)?;
        self.inner.memory.cpu_read(self.addr + offset, buf)
    }

    /// Writes through the CPU cache.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] past the end of the buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DmaError> {
        check_bounds(offset, data.len(), self.len)?;
        self.inner.memory.cpu_write(self.addr + offset, data)
    }
}

impl DmaMemory for StreamingBuffer {
    fn cpu_segments(&self) -> Vec<Segment> {
        vec![self.segment()]
    }

    fn is_coherent(&self) -> bool {
        false
    }
}

impl Drop for StreamingBuffer {
    fn drop(&mut self) {
        self.inner.memory.deallocate(self.addr, self.len);
    }
}

// ---- Scatter-gather ---------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct SgEntry {
    pub(crate) segment: Segment,
    pub(crate) dev_addr: u64,
    pub(crate) map_id: u64,
}

/// Segments mapped for the device as one transfer.
///
/// Device addresses are valid until the list is unmapped or dropped.
pub struct ScatterGatherList {
    inner: Arc<EngineInner>,
    entries: Vec<SgEntry>,
    direction: DmaDirection,
}

impl core::fmt::Debug for ScatterGatherList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScatterGatherList")
            .field("entries", &self.entries)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl ScatterGatherList {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        entries: Vec<SgEntry>,
        direction: DmaDirection,
    ) -> Self {
        Self {
            inner,
            entries,
            direction,
        }
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the list has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Transfer direction.
    #[must_use]
    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Total bytes across segments.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.segment.len).sum()
    }

    /// CPU segments in order.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        self.entries.iter().map(|e| e.segment)
    }

    /// Device addresses in segment order.
    #[must_use]
    pub fn device_addrs(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.dev_addr).collect()
    }

    /// `true` while every segment's device mapping is live.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        let table = self.inner.mappings.lock();
        !self.entries.is_empty() && self.entries.iter().all(|e| table.get(e.map_id).is_some())
    }

    pub(crate) fn unmap_entries(&mut self) -> usize {
        let mut table = self.inner.mappings.lock();
        let mut unmapped = 0;
        for entry in self.entries.iter().rev() {
            if table.unmap(entry.map_id).is_some() {
                unmapped += 1;
            }
        }
        unmapped
    }
}

impl DmaMemory for ScatterGatherList {
    fn cpu_segments(&self) -> Vec<Segment> {
        self.segments().collect()
    }

    fn is_coherent(&self) -> bool {
        false
    }
}

impl Drop for ScatterGatherList {
    fn drop(&mut self) {
        self.unmap_entries();
    }
}
