//! Fixed-size DMA block pools.
//!
//! A pool carves one coherent region into equal, aligned blocks and hands
//! them out from a free stack, so allocation and free are O(1).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::DmaError;
use crate::buffer::{CoherentBuffer, DmaMemory, Segment, check_bounds};

struct PoolInner {
    name: String,
    block_size: u64,
    stride: u64,
    count: u32,
    cpu_base: u64,
    dev_base: u64,
    region: Mutex<Option<CoherentBuffer>>,
    free: Mutex<FreeList>,
}

/// Free block indices plus the destroyed flag, under one lock so that
/// `alloc` and `destroy` cannot interleave.
struct FreeList {
    stack: Vec<u32>,
    destroyed: bool,
}

/// A pool of equal-sized coherent blocks.
#[derive(Clone)]
pub struct DmaPool {
    inner: Arc<PoolInner>,
}

impl core::fmt::Debug for DmaPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaPool")
            .field("name", &self.inner.name)
            .field("block_size", &self.inner.block_size)
            .field("available", &self.available())
            .field("capacity", &self.inner.count)
            .finish()
    }
}

impl DmaPool {
    pub(crate) fn new(
        name: &str,
        block_size: u64,
        stride: u64,
        count: u32,
        region: CoherentBuffer,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.to_owned(),
                block_size,
                stride,
                count,
                cpu_base: region.cpu_addr(),
                dev_base: region.device_addr(),
                region: Mutex::new(Some(region)),
                free: Mutex::new(FreeList {
                    stack: (0..count).rev().collect(),
                    destroyed: false,
                }),
            }),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Usable bytes per block.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.inner.block_size
    }

    /// Total number of blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.count as usize
    }

    /// Blocks ready to hand out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.lock().stack.len()
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Takes a block.
    ///
    /// # Errors
    ///
    /// [`DmaError::PoolExhausted`] if every block is out,
    /// [`DmaError::PoolDestroyed`] after [`destroy`](Self::destroy).
    pub fn alloc(&self) -> Result<PoolBuffer, DmaError> {
        let mut free = self.inner.free.lock();
        if free.destroyed {
            return Err(DmaError::PoolDestroyed {
                pool: self.inner.name.clone(),
            });
        }
        let index = free.stack.pop().ok_or_else(|| DmaError::PoolExhausted {
            pool: self.inner.name.clone(),
        })?;
        drop(free);
        let offset = u64::from(index) * self.inner.stride;
        Ok(PoolBuffer {
            pool: Arc::clone(&self.inner),
            index,
            cpu_addr: self.inner.cpu_base + offset,
            dev_addr: self.inner.dev_base + offset,
        })
    }

    /// Frees the backing region. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// [`DmaError::PoolNotEmpty`] while blocks are out; the pool stays
    /// usable.
    pub fn destroy(&self) -> Result<(), DmaError> {
        let mut free = self.inner.free.lock();
        let outstanding = self.inner.count as usize - free.stack.len();
        if outstanding > 0 {
            return Err(DmaError::PoolNotEmpty {
                pool: self.inner.name.clone(),
                outstanding,
            });
        }
        free.destroyed = true;
        let region = self.inner.region.lock().take();
        drop(free);
        if region.is_some() {
            log::debug!(target: "platdev::dma", "pool {}: destroyed", self.inner.name);
        }
        drop(region);
        Ok(())
    }
}

/// One block of a [`DmaPool`]. Returned to the pool when dropped.
pub struct PoolBuffer {
    pool: Arc<PoolInner>,
    index: u32,
    cpu_addr: u64,
    dev_addr: u64,
}

impl core::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("dev_addr", &format_args!("{:#x}", self.dev_addr))
            .finish()
    }
}

impl PoolBuffer {
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

    /// Block size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.pool.block_size
    }

    /// Always `false`; pools reject zero-sized blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pool.block_size == 0
    }

    pub(crate) fn belongs_to(&self, pool: &DmaPool) -> bool {
        Arc::ptr_eq(&self.pool, &pool.inner)
    }

    /// Reads from the block.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] past the end of the block.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        check_bounds(offset, buf.len(), self.pool.block_size)?;
        let region = self.pool.region.lock();
        match region.as_ref() {
            Some(region) => region.read(self.cpu_addr - self.pool.cpu_base + offset, buf),
            None => Err(DmaError::PoolDestroyed {
                pool: self.pool.name.clone(),
            }),
        }
    }

    /// Writes to the block.
    ///
    /// # Errors
    ///
    /// [`DmaError::OutOfBounds`] past the end of the block.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DmaError> {
        check_bounds(offset, data.len(), self.pool.block_size)?;
        let region = self.pool.region.lock();
        match region.as_ref() {
            Some(region) => region.write(self.cpu_addr - self.pool.cpu_base + offset, data),
            None => Err(DmaError::PoolDestroyed {
                pool: self.pool.name.clone(),
            }),
        }
    }
}

impl DmaMemory for PoolBuffer {
    fn cpu_segments(&self) -> Vec<Segment> {
        vec![Segment::new(self.cpu_addr, self.pool.block_size)]
    }

    fn is_coherent(&self) -> bool {
        true
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.free.lock().stack.push(self.index);
    }
}
