//! Emulated system memory with a write-back CPU cache.
//!
//! CPU accesses to streaming memory go through a cache of `line_size`
//! lines: reads fill lines from RAM, writes dirty them, and nothing reaches
//! RAM until the line is cleaned. Devices always access RAM directly. A
//! transfer that skips the required cache maintenance therefore observes
//! stale data, as it would on a non-coherent bus.
//!
//! In hardware-coherent mode the cache is bypassed and maintenance is a
//! no-op.

use std::collections::BTreeMap;
use std::ops::Range;

use parking_lot::Mutex;
use platdev_core::config::DmaConfig;

use crate::DmaError;
use crate::region::{RegionAllocator, align_up};

#[derive(Debug)]
struct CacheLine {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
struct MemState {
    ram: Vec<u8>,
    /// Cached lines keyed by line-aligned RAM offset.
    lines: BTreeMap<usize, CacheLine>,
}

/// System RAM as seen by the CPU and by bus-mastering devices.
#[derive(Debug)]
pub struct SystemMemory {
    base: u64,
    size: u64,
    line_size: usize,
    coherent: bool,
    state: Mutex<MemState>,
    allocator: Mutex<RegionAllocator>,
}

impl SystemMemory {
    /// Creates zeroed memory as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::InvalidConfig`] if the cache line size is not a
    /// power of two, or the memory window is not line-aligned or too large
    /// for the host.
    pub fn new(config: &DmaConfig) -> Result<Self, DmaError> {
        let line_size = config.cache_line_size;
        if !line_size.is_power_of_two() {
            return Err(DmaError::InvalidConfig("cache line size must be a power of two"));
        }
        let line = line_size as u64;
        if config.memory_base % line != 0 || config.memory_size % line != 0 {
            return Err(DmaError::InvalidConfig("memory window must be cache-line aligned"));
        }
        let bytes = usize::try_from(config.memory_size)
            .map_err(|_| DmaError::InvalidConfig("memory size exceeds host address space"))?;
        log::debug!(
            target: "platdev::dma",
            "system memory {:#x}+{:#x}, {line_size}-byte lines, {}",
            config.memory_base,
            config.memory_size,
            if config.coherent { "coherent" } else { "non-coherent" }
        );
        Ok(Self {
            base: config.memory_base,
            size: config.memory_size,
            line_size,
            coherent: config.coherent,
            state: Mutex::new(MemState {
                ram: vec![0; bytes],
                lines: BTreeMap::new(),
            }),
            allocator: Mutex::new(RegionAllocator::new(
                config.memory_base,
                config.memory_size,
                line,
            )),
        })
    }

    /// Physical base address.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Cache line size in bytes.
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// `true` if devices snoop the CPU cache.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// `true` if `[addr, addr + len)` lies inside RAM.
    #[must_use]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.size)
    }

    fn offsets(&self, addr: u64, len: usize) -> Result<Range<usize>, DmaError> {
        let len64 = len as u64;
        if !self.contains(addr, len64) {
            return Err(DmaError::InvalidSegment { addr, len: len64 });
        }
        // In range of `ram`, so it fits in usize.
        #[allow(clippy::cast_possible_truncation)]
        let start = (addr - self.base) as usize;
        Ok(start..start + len)
    }

    // ---- Allocation -----------------------------------------------------------

    pub(crate) fn allocate(&self, len: u64, align: u64) -> Result<u64, DmaError> {
        let addr = self
            .allocator
            .lock()
            .allocate(len, align)
            .ok_or(DmaError::OutOfMemory { len })?;
        self.scrub(addr, len)?;
        Ok(addr)
    }

    pub(crate) fn deallocate(&self, addr: u64, len: u64) {
        if let Ok(range) = self.offsets(addr, self.rounded(len)) {
            self.drop_lines(range);
        }
        self.allocator.lock().deallocate(addr, len);
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocator.lock().allocated_bytes()
    }

    fn rounded(&self, len: u64) -> usize {
        let rounded = align_up(len.max(1), self.line_size as u64).unwrap_or(len);
        usize::try_from(rounded).unwrap_or(usize::MAX)
    }

    /// Zeroes fresh memory and forgets any cached copy of it.
    fn scrub(&self, addr: u64, len: u64) -> Result<(), DmaError> {
        let range = self.offsets(addr, self.rounded(len))?;
        let mut state = self.state.lock();
        state.ram[range.clone()].fill(0);
        Self::drop_lines_locked(&mut state, range, self.line_size);
        Ok(())
    }

    // ---- CPU access -----------------------------------------------------------

    /// Reads through the CPU cache.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidSegment`] if the range is outside RAM.
    pub fn cpu_read(&self, addr: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        if self.coherent {
            return self.read_uncached(addr, buf);
        }
        let range = self.offsets(addr, buf.len())?;
        let mut guard = self.state.lock();
        let MemState { ram, lines } = &mut *guard;
        let mut done = 0;
        for (line, within) in self.split_lines(range) {
            let n = within.len();
            let cached = lines.entry(line).or_insert_with(|| CacheLine {
                data: ram[line..line + self.line_size].to_vec(),
                dirty: false,
            });
            buf[done..done + n].copy_from_slice(&cached.data[within]);
            done += n;
        }
        Ok(())
    }

    /// Writes through the CPU cache. The data stays in dirty lines until
    /// cleaned.
    ///
    /// # Errors
    ///
    /// [`DmaError::InvalidSegment`] if the range is outside RAM.
    pub fn cpu_write(&self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        if self.coherent {
            return self.write_uncached(addr, data);
        }
        let range = self.offsets(addr, data.len())?;
        let mut guard = self.state.lock();
        let MemState { ram, lines } = &mut *guard;
        let mut done = 0;
        for (line, within) in self.split_lines(range) {
            let n = within.len();
            let cached = lines.entry(line).or_insert_with(|| CacheLine {
                data: ram[line..line + self.line_size].to_vec(),
                dirty: false,
            });
            cached.data[within].copy_from_slice(&data[done..done + n]);
            cached.dirty = true;
            done += n;
        }
        Ok(())
    }

    /// Splits a RAM offset range into `(line offset, range within line)`.
    fn split_lines(&self, range: Range<usize>) -> Vec<(usize, Range<usize>)> {
        let mut out = Vec::new();
        let mut pos = range.start;
        while pos < range.end {
            let line = pos & !(self.line_size - 1);
            let end = (line + self.line_size).min(range.end);
            out.push((line, pos - line..end - line));
            pos = end;
        }
        out
    }

    // ---- Uncached and device access -------------------------------------------

    /// Reads RAM directly, bypassing the cache.
    pub(crate) fn read_uncached(&self, addr: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        let range = self.offsets(addr, buf.len())?;
        buf.copy_from_slice(&self.state.lock().ram[range]);
        Ok(())
    }

    /// Writes RAM directly, bypassing the cache.
    pub(crate) fn write_uncached(&self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        let range = self.offsets(addr, data.len())?;
        self.state.lock().ram[range].copy_from_slice(data);
        Ok(())
    }

    // ---- Cache maintenance ----------------------------------------------------

    fn line_span(&self, range: &Range<usize>) -> Range<usize> {
        let start = range.start & !(self.line_size - 1);
        let end = (range.end + self.line_size - 1) & !(self.line_size - 1);
        start..end
    }

    /// Writes dirty lines covering the range back to RAM.
    pub(crate) fn clean(&self, addr: u64, len: u64) -> Result<(), DmaError> {
        if self.coherent {
            return Ok(());
        }
        let range = self.offsets(addr, usize::try_from(len).unwrap_or(usize::MAX))?;
        let span = self.line_span(&range);
        let mut guard = self.state.lock();
        let MemState { ram, lines } = &mut *guard;
        for (&line, cached) in lines.range_mut(span) {
            if cached.dirty {
                ram[line..line + self.line_size].copy_from_slice(&cached.data);
                cached.dirty = false;
            }
        }
        Ok(())
    }

    /// Discards cached lines covering the range, dirty or not.
    pub(crate) fn invalidate(&self, addr: u64, len: u64) -> Result<(), DmaError> {
        if self.coherent {
            return Ok(());
        }
        let range = self.offsets(addr, usize::try_from(len).unwrap_or(usize::MAX))?;
        self.drop_lines(range);
        Ok(())
    }

    fn drop_lines(&self, range: Range<usize>) {
        let mut state = self.state.lock();
        Self::drop_lines_locked(&mut state, range, self.line_size);
    }

    fn drop_lines_locked(state: &mut MemState, range: Range<usize>, line_size: usize) {
        let start = range.start & !(line_size - 1);
        let doomed: Vec<usize> = state
            .lines
            .range(start..range.end)
            .map(|(&line, _)| line)
            .collect();
        for line in doomed {
            state.lines.remove(&line);
        }
    }

    /// Number of lines currently cached.
    #[must_use]
    pub fn cached_lines(&self) -> usize {
        self.state.lock().lines.len()
    }

    /// Number of cached lines not yet written back.
    #[must_use]
    pub fn dirty_lines(&self) -> usize {
        self.state
            .lock()
            .lines
            .values()
            .filter(|l| l.dirty)
            .count()
    }
}
