//! Bounds-checked register windows.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::platform::{RegisterIo, Width};

/// Errors from register access through an [`MmioWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioError {
    /// The access extends past the end of the window.
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Window length.
        length: u64,
    },
    /// The offset is not a multiple of the access width.
    Misaligned {
        /// Requested offset.
        offset: u64,
    },
    /// The window has been released.
    Unmapped,
}

impl fmt::Display for MmioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { offset, length } => {
                write!(f, "register offset {offset:#x} outside window of {length:#x} bytes")
            }
            Self::Misaligned { offset } => write!(f, "misaligned register offset {offset:#x}"),
            Self::Unmapped => f.write_str("register window has been released"),
        }
    }
}

impl std::error::Error for MmioError {}

/// A handle on a mapped register window.
///
/// Cloneable; every clone stops working once the owning resource is
/// released, so a stale handle can never reach a window that has been
/// handed to another device.
#[derive(Clone)]
pub struct MmioWindow {
    base: u64,
    length: u64,
    io: Arc<dyn RegisterIo>,
    live: Arc<AtomicBool>,
}

impl fmt::Debug for MmioWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioWindow")
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &format_args!("{:#x}", self.length))
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

macro_rules! accessors {
    ($($read:ident, $write:ident, $ty:ty, $width:expr;)*) => {
        $(
            #[doc = concat!("Reads a `", stringify!($ty), "` register at `offset`.")]
            ///
            /// # Errors
            ///
            /// See [`MmioError`].
            pub fn $read(&self, offset: u64) -> Result<$ty, MmioError> {
                self.check(offset, $width)?;
                // The backend never returns bits beyond the access width.
                #[allow(clippy::cast_possible_truncation)]
                let value = self.io.read(offset, $width) as $ty;
                Ok(value)
            }

            #[doc = concat!("Writes a `", stringify!($ty), "` register at `offset`.")]
            ///
            /// # Errors
            ///
            /// See [`MmioError`].
            pub fn $write(&self, offset: u64, value: $ty) -> Result<(), MmioError> {
                self.check(offset, $width)?;
                self.io.write(offset, $width, u64::from(value));
                Ok(())
            }
        )*
    };
}

impl MmioWindow {
    pub(crate) fn new(base: u64, length: u64, io: Arc<dyn RegisterIo>) -> Self {
        Self {
            base,
            length,
            io,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Bus address of the window.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the window in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns `false` once the window has been released.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns `true` if `[base, base + length)` overlaps this window.
    #[must_use]
    pub fn overlaps(&self, base: u64, length: u64) -> bool {
        ranges_overlap(self.base, self.length, base, length)
    }

    pub(crate) fn revoke(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn check(&self, offset: u64, width: Width) -> Result<(), MmioError> {
        if !self.is_live() {
            return Err(MmioError::Unmapped);
        }
        let end = offset.checked_add(width.bytes());
        if end.is_none_or(|end| end > self.length) {
            return Err(MmioError::OutOfBounds {
                offset,
                length: self.length,
            });
        }
        if offset % width.bytes() != 0 {
            return Err(MmioError::Misaligned { offset });
        }
        Ok(())
    }

    accessors! {
        read8, write8, u8, Width::U8;
        read16, write16, u16, Width::U16;
        read32, write32, u32, Width::U32;
        read64, write64, u64, Width::U64;
    }
}

/// `true` if two half-open ranges overlap. Empty ranges overlap nothing.
#[must_use]
pub fn ranges_overlap(a_base: u64, a_len: u64, b_base: u64, b_len: u64) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    let a_end = a_base.saturating_add(a_len);
    let b_end = b_base.saturating_add(b_len);
    a_base < b_end && b_base < a_end
}
