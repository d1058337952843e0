//! `platdev-dma` --- DMA buffer management.
//!
//! A [`DmaEngine`] owns an emulated system memory with a write-back CPU
//! cache and a device address space. It hands out three kinds of buffers:
//!
//! - [`CoherentBuffer`]: mapped for the device for its whole life and
//!   accessed uncached, so no sync is ever needed.
//! - [`ScatterGatherList`]: cached memory mapped for one transfer with
//!   [`DmaEngine::map_sg`]. CPU and device only agree on its contents after
//!   [`DmaEngine::sync_for_device`] / [`DmaEngine::sync_for_cpu`].
//! - [`PoolBuffer`]: a fixed-size block from a [`DmaPool`].
//!
//! The device side of every transfer goes through a [`DevicePort`], which
//! refuses addresses outside a live mapping.

mod buffer;
mod engine;
mod mapping;
mod memory;
mod pool;
mod region;

use core::fmt;

pub use buffer::{CoherentBuffer, DmaMemory, ScatterGatherList, Segment, StreamingBuffer};
pub use engine::DmaEngine;
pub use mapping::{DevicePort, DmaDirection};
pub use memory::SystemMemory;
pub use platdev_core::sync::{CompletionSignal, WaitOutcome};
pub use pool::{DmaPool, PoolBuffer};
pub use region::RegionAllocator;

/// Errors from DMA allocation, mapping, and access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// The engine configuration is unusable.
    InvalidConfig(&'static str),
    /// System memory has no free range of the requested size.
    OutOfMemory {
        /// Requested length.
        len: u64,
    },
    /// A segment is empty or lies outside system memory.
    InvalidSegment {
        /// Segment address.
        addr: u64,
        /// Segment length.
        len: u64,
    },
    /// The device address would exceed the DMA mask.
    BeyondMask {
        /// First device address of the mapping.
        addr: u64,
        /// The engine's mask.
        mask: u64,
    },
    /// `map_sg` was given no segments.
    EmptyScatterList,
    /// A scatter-gather mapping failed part-way and was rolled back.
    PartialMapFailure {
        /// Index of the segment that failed.
        index: usize,
        /// Number of segments that had been mapped and were unmapped again.
        unmapped: usize,
        /// Why the segment failed.
        cause: Box<DmaError>,
    },
    /// A device access hit no live mapping.
    NotMapped {
        /// Device address.
        addr: u64,
    },
    /// A device access went against the mapping's direction.
    AccessDenied {
        /// Device address.
        addr: u64,
    },
    /// A CPU access fell outside the buffer.
    OutOfBounds {
        /// Offset into the buffer.
        offset: u64,
        /// Access length.
        len: u64,
    },
    /// Bad pool parameters, or a buffer returned to the wrong pool.
    InvalidPool(&'static str),
    /// Every block of the pool is checked out.
    PoolExhausted {
        /// Pool name.
        pool: String,
    },
    /// The pool still has blocks checked out.
    PoolNotEmpty {
        /// Pool name.
        pool: String,
        /// Blocks still out.
        outstanding: usize,
    },
    /// The pool has been destroyed.
    PoolDestroyed {
        /// Pool name.
        pool: String,
    },
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(why) => write!(f, "invalid DMA configuration: {why}"),
            Self::OutOfMemory { len } => write!(f, "out of DMA memory allocating {len:#x} bytes"),
            Self::InvalidSegment { addr, len } => {
                write!(f, "invalid segment {addr:#x}+{len:#x}")
            }
            Self::BeyondMask { addr, mask } => {
                write!(f, "device address {addr:#x} exceeds DMA mask {mask:#x}")
            }
            Self::EmptyScatterList => f.write_str("empty scatter-gather list"),
            Self::PartialMapFailure {
                index,
                unmapped,
                cause,
            } => write!(
                f,
                "segment {index} failed to map ({cause}); {unmapped} segments unmapped"
            ),
            Self::NotMapped { addr } => write!(f, "device address {addr:#x} is not mapped"),
            Self::AccessDenied { addr } => {
                write!(f, "device access to {addr:#x} denied by mapping direction")
            }
            Self::OutOfBounds { offset, len } => {
                write!(f, "access {offset:#x}+{len:#x} out of buffer bounds")
            }
            Self::InvalidPool(why) => write!(f, "invalid pool: {why}"),
            Self::PoolExhausted { pool } => write!(f, "pool {pool} exhausted"),
            Self::PoolNotEmpty { pool, outstanding } => {
                write!(f, "pool {pool} has {outstanding} buffers outstanding")
            }
            Self::PoolDestroyed { pool } => write!(f, "pool {pool} has been destroyed"),
        }
    }
}

impl std::error::Error for DmaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PartialMapFailure { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}
