//! Flattened Device Tree (DTB) parsing.
//!
//! [`reader`] turns a blob into an owned [`HardwareNode`](crate::HardwareNode)
//! tree.

use core::fmt;

pub mod reader;

/// FDT magic number.
pub const FDT_MAGIC: u32 = 0xd00d_feed;

/// Minimum last-compatible version we accept.
pub const FDT_MIN_COMPAT_VERSION: u32 = 16;

/// Size of the fixed header in bytes.
pub const FDT_HEADER_SIZE: usize = 40;

// ---- Token constants --------------------------------------------------------

pub(crate) const FDT_BEGIN_NODE: u32 = 0x0000_0001;
pub(crate) const FDT_END_NODE: u32 = 0x0000_0002;
pub(crate) const FDT_PROP: u32 = 0x0000_0003;
pub(crate) const FDT_NOP: u32 = 0x0000_0004;
pub(crate) const FDT_END: u32 = 0x0000_0009;

/// Errors that can occur during FDT parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtError {
    /// The magic number was not `0xd00dfeed`.
    InvalidMagic,
    /// The `last_comp_version` field is below the minimum we support (16).
    UnsupportedVersion,
    /// The DTB data is shorter than the header or declared block offsets.
    TruncatedData,
    /// A structural invariant was violated (bad token, unbalanced nodes,
    /// string offset out of range, nesting too deep).
    InvalidStructure,
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => f.write_str("bad magic number"),
            Self::UnsupportedVersion => f.write_str("unsupported version"),
            Self::TruncatedData => f.write_str("truncated data"),
            Self::InvalidStructure => f.write_str("invalid structure block"),
        }
    }
}

impl std::error::Error for FdtError {}

/// A single memory reservation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemReservation {
    /// Physical start address of the reserved region.
    pub address: u64,
    /// Size in bytes of the reserved region.
    pub size: u64,
}

/// Rounds `offset` up to the next 4-byte boundary.
pub(crate) fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}
