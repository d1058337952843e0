//! Address range allocator.
//!
//! [`RegionAllocator`] hands out aligned ranges from a fixed window. It keeps
//! a bump watermark plus a sorted free list with immediate neighbor
//! coalescing. It backs the emulated system RAM.
//!
//! # Algorithm
//!
//! - **Allocate**: first-fit scan of the free list, splitting the chosen range
//!   around the aligned block; fall back to bumping the watermark, putting
//!   any alignment gap on the free list.
//! - **Deallocate**: binary-search for the insertion point, coalesce with
//!   neighbors, retract the watermark if the freed range is at the tail.

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// A contiguous free range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    base: u64,
    size: u64,
}

impl FreeRange {
    fn end(self) -> u64 {
        self.base + self.size
    }
}

/// A range allocator over `[base, base + size)`.
///
/// Every allocation is rounded up to a multiple of `granule`, and every base
/// is aligned to at least `granule`.
#[derive(Debug)]
pub struct RegionAllocator {
    base: u64,
    end: u64,
    granule: u64,
    /// Free ranges below the watermark, sorted by base. Adjacent ranges are
    /// always coalesced.
    free_list: Vec<FreeRange>,
    watermark: u64,
}

impl RegionAllocator {
    /// Creates an allocator covering `[base, base + size)`. `granule` must be
    /// a power of two.
    #[must_use]
    pub fn new(base: u64, size: u64, granule: u64) -> Self {
        Self {
            base,
            end: base.saturating_add(size),
            granule: granule.max(1),
            free_list: Vec::new(),
            watermark: base,
        }
    }

    /// Allocates `size` bytes aligned to `align` (raised to the granule).
    /// Returns `None` when no range fits.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let size = align_up(size.max(1), self.granule)?;
        let align = align.max(self.granule);
        if !align.is_power_of_two() {
            return None;
        }

        // First-fit scan of the free list.
        for i in 0..self.free_list.len() {
            let entry = self.free_list[i];
            let Some(start) = align_up(entry.base, align) else {
                continue;
            };
            let Some(end) = start.checked_add(size) else {
                continue;
            };
            if end > entry.end() {
                continue;
            }
            let head = FreeRange {
                base: entry.base,
                size: start - entry.base,
            };
            let tail = FreeRange {
                base: end,
                size: entry.end() - end,
            };
            match (head.size > 0, tail.size > 0) {
                (true, true) => {
                    self.free_list[i] = head;
                    self.free_list.insert(i + 1, tail);
                }
                (true, false) => self.free_list[i] = head,
                (false, true) => self.free_list[i] = tail,
                (false, false) => {
                    self.free_list.remove(i);
                }
            }
            return Some(start);
        }

        // Fall back to bump allocation.
        let start = align_up(self.watermark, align)?;
        let end = start.checked_add(size)?;
        if end > self.end {
            return None;
        }
        if start > self.watermark {
            self.push_tail(FreeRange {
                base: self.watermark,
                size: start - self.watermark,
            });
        }
        self.watermark = end;
        Some(start)
    }

    /// Returns a range previously handed out by [`allocate`](Self::allocate).
    /// `size` must match the original request.
    ///
    /// # Panics
    ///
    /// Debug-panics if the range is outside the window or overlaps a free
    /// range (double free).
    pub fn deallocate(&mut self, addr: u64, size: u64) {
        let Some(size) = align_up(size.max(1), self.granule) else {
            return;
        };
        let range_end = addr + size;
        debug_assert!(addr >= self.base, "deallocate: address below window base");
        debug_assert!(range_end <= self.watermark, "deallocate: range beyond watermark");

        if range_end == self.watermark {
            self.watermark = addr;
            self.retract_watermark();
            return;
        }

        let idx = match self.free_list.binary_search_by_key(&addr, |r| r.base) {
            Ok(i) | Err(i) => i,
        };
        debug_assert!(
            idx == 0 || self.free_list[idx - 1].end() <= addr,
            "deallocate: overlaps predecessor (double free?)"
        );
        debug_assert!(
            idx >= self.free_list.len() || self.free_list[idx].base >= range_end,
            "deallocate: overlaps successor (double free?)"
        );

        let merge_prev = idx > 0 && self.free_list[idx - 1].end() == addr;
        let merge_next = idx < self.free_list.len() && self.free_list[idx].base == range_end;
        match (merge_prev, merge_next) {
            (true, true) => {
                let succ = self.free_list.remove(idx);
                self.free_list[idx - 1].size += size + succ.size;
            }
            (true, false) => self.free_list[idx - 1].size += size,
            (false, true) => {
                self.free_list[idx].base = addr;
                self.free_list[idx].size += size;
            }
            (false, false) => self.free_list.insert(idx, FreeRange { base: addr, size }),
        }
        self.retract_watermark();
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.watermark - self.base - self.free_bytes()
    }

    /// Bytes on the free list (below the watermark).
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_list.iter().map(|r| r.size).sum()
    }

    /// Number of free-list entries.
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    fn push_tail(&mut self, range: FreeRange) {
        match self.free_list.last_mut() {
            Some(last) if last.end() == range.base => last.size += range.size,
            _ => self.free_list.push(range),
        }
    }

    fn retract_watermark(&mut self) {
        while let Some(last) = self.free_list.last() {
            if last.end() != self.watermark {
                break;
            }
            self.watermark = last.base;
            self.free_list.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc() -> RegionAllocator {
        RegionAllocator::new(0x1000, 0x10000, 0x1000)
    }

    #[test]
    fn bump_and_round() {
        let mut a = alloc();
        assert_eq!(a.allocate(1, 1), Some(0x1000));
        assert_eq!(a.allocate(0x1001, 1), Some(0x2000));
        assert_eq!(a.allocate(0x1000, 1), Some(0x4000));
        assert_eq!(a.allocated_bytes(), 0x4000);
    }

    #[test]
    fn exhaustion() {
        let mut a = RegionAllocator::new(0x1000, 0x2000, 0x1000);
        assert!(a.allocate(0x1000, 1).is_some());
        assert!(a.allocate(0x1000, 1).is_some());
        assert!(a.allocate(0x1000, 1).is_none());
        assert!(RegionAllocator::new(0x1000, 0x2000, 0x1000)
            .allocate(0x3000, 1)
            .is_none());
    }

    #[test]
    fn reuse_freed_hole() {
        let mut a = alloc();
        let x = a.allocate(0x1000, 1).unwrap();
        let _y = a.allocate(0x1000, 1).unwrap();
        a.deallocate(x, 0x1000);
        assert_eq!(a.free_list_len(), 1);
        assert_eq!(a.allocate(0x1000, 1), Some(x));
        assert_eq!(a.free_list_len(), 0);
    }

    #[test]
    fn coalesce_both_neighbors() {
        let mut a = alloc();
        let x = a.allocate(0x1000, 1).unwrap();
        let y = a.allocate(0x1000, 1).unwrap();
        let z = a.allocate(0x1000, 1).unwrap();
        let _w = a.allocate(0x1000, 1).unwrap();
        a.deallocate(x, 0x1000);
        a.deallocate(z, 0x1000);
        assert_eq!(a.free_list_len(), 2);
        a.deallocate(y, 0x1000);
        assert_eq!(a.free_list_len(), 1);
        assert_eq!(a.free_bytes(), 0x3000);
    }

    #[test]
    fn watermark_retracts_through_free_tail() {
        let mut a = alloc();
        let x = a.allocate(0x1000, 1).unwrap();
        let y = a.allocate(0x1000, 1).unwrap();
        let z = a.allocate(0x1000, 1).unwrap();
        a.deallocate(y, 0x1000);
        a.deallocate(z, 0x1000);
        assert_eq!(a.free_list_len(), 0);
        a.deallocate(x, 0x1000);
        assert_eq!(a.allocated_bytes(), 0);
        assert_eq!(a.allocate(0x1000, 1), Some(0x1000));
    }

    #[test]
    fn alignment_gap_is_reusable() {
        let mut a = RegionAllocator::new(0x1000, 0x10000, 0x40);
        assert_eq!(a.allocate(0x40, 1), Some(0x1000));
        // Next 0x1000-aligned base leaves a gap behind it.
        assert_eq!(a.allocate(0x40, 0x1000), Some(0x2000));
        assert_eq!(a.free_bytes(), 0x1000 - 0x40);
        assert_eq!(a.allocate(0x80, 1), Some(0x1040));
    }

    #[test]
    fn split_free_range_around_aligned_block() {
        let mut a = RegionAllocator::new(0, 0x10000, 0x40);
        let _first = a.allocate(0x40, 1).unwrap();
        let big = a.allocate(0x400, 1).unwrap();
        let _guard = a.allocate(0x40, 1).unwrap();
        a.deallocate(big, 0x400);
        assert_eq!(a.allocate(0x40, 0x100), Some(0x100));
        // Head [0x40, 0x100) and tail [0x140, 0x440) remain.
        assert_eq!(a.free_list_len(), 2);
        assert_eq!(a.free_bytes(), 0x400 - 0x40);
    }
}
