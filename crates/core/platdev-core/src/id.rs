//! Identifier newtypes.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Identifies one device instance for the lifetime of a `DeviceManager`.
///
/// Ids are never reused; a device that is removed and probed again gets a
/// fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Creates a device id from a raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Monotonic allocator for [`DeviceId`]s.
#[derive(Debug)]
pub struct DeviceIdAllocator {
    next: AtomicU32,
}

impl DeviceIdAllocator {
    /// Creates an allocator whose first id is `dev1`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Hands out the next unused id.
    pub fn allocate(&self) -> DeviceId {
        DeviceId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for DeviceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
