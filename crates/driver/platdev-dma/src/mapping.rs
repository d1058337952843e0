//! Device mappings.
//!
//! Device addresses equal physical addresses, limited by the DMA mask. The
//! device can only reach memory through a live mapping, in the direction the
//! mapping allows.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::DmaError;
use crate::engine::EngineInner;

/// Direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads memory.
    ToDevice,
    /// The device writes memory.
    FromDevice,
    /// Both.
    Bidirectional,
}

impl DmaDirection {
    /// `true` if the device may read through the mapping.
    #[must_use]
    pub fn device_reads(self) -> bool {
        matches!(self, Self::ToDevice | Self::Bidirectional)
    }

    /// `true` if the device may write through the mapping.
    #[must_use]
    pub fn device_writes(self) -> bool {
        matches!(self, Self::FromDevice | Self::Bidirectional)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mapping {
    pub(crate) addr: u64,
    pub(crate) len: u64,
    pub(crate) direction: DmaDirection,
}

#[derive(Debug)]
pub(crate) struct MappingTable {
    mask: u64,
    entries: BTreeMap<u64, Mapping>,
    next_id: u64,
}

impl MappingTable {
    pub(crate) fn new(mask: u64) -> Self {
        Self {
            mask,
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn mask(&self) -> u64 {
        self.mask
    }

    /// Maps `[addr, addr + len)`. Returns the mapping id and device address.
    pub(crate) fn map(
        &mut self,
        addr: u64,
        len: u64,
        direction: DmaDirection,
    ) -> Result<(u64, u64), DmaError> {
        if len == 0 {
            return Err(DmaError::InvalidSegment { addr, len });
        }
        if addr.saturating_add(len - 1) > self.mask {
            return Err(DmaError::BeyondMask {
                addr,
                mask: self.mask,
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Mapping {
                addr,
                len,
                direction,
            },
        );
        Ok((id, addr))
    }

    pub(crate) fn unmap(&mut self, id: u64) -> Option<Mapping> {
        self.entries.remove(&id)
    }

    pub(crate) fn get(&self, id: u64) -> Option<&Mapping> {
        self.entries.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks that a device access falls inside one live mapping that allows
    /// it.
    pub(crate) fn check(&self, dev: u64, len: u64, write: bool) -> Result<u64, DmaError> {
        let end = dev
            .checked_add(len)
            .ok_or(DmaError::NotMapped { addr: dev })?;
        let mapping = self
            .entries
            .values()
            .find(|m| dev >= m.addr && end <= m.addr + m.len)
            .ok_or(DmaError::NotMapped { addr: dev })?;
        let allowed = if write {
            mapping.direction.device_writes()
        } else {
            mapping.direction.device_reads()
        };
        if !allowed {
            return Err(DmaError::AccessDenied { addr: dev });
        }
        Ok(dev)
    }
}

/// The device side of the bus: memory access by device address.
///
/// Stands in for a bus-mastering device in tests and simulations. Every
/// access goes straight to RAM, bypassing the CPU cache.
#[derive(Clone)]
pub struct DevicePort {
    inner: Arc<EngineInner>,
}

impl core::fmt::Debug for DevicePort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DevicePort").finish_non_exhaustive()
    }
}

impl DevicePort {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Reads memory the way the device would.
    ///
    /// # Errors
    ///
    /// [`DmaError::NotMapped`] outside a live mapping,
    /// [`DmaError::AccessDenied`] for a mapping the device may not read.
    pub fn read(&self, dev_addr: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        let phys = self
            .inner
            .mappings
            .lock()
            .check(dev_addr, buf.len() as u64, false)?;
        self.inner.memory.read_uncached(phys, buf)
    }

    /// Writes memory the way the device would.
    ///
    /// # Errors
    ///
    /// [`DmaError::NotMapped`] outside a live mapping,
    /// [`DmaError::AccessDenied`] for a mapping the device may not write.
    pub fn write(&self, dev_addr: u64, data: &[u8]) -> Result<(), DmaError> {
        let phys = self
            .inner
            .mappings
            .lock()
            .check(dev_addr, data.len() as u64, true)?;
        self.inner.memory.write_uncached(phys, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_enforces_direction() {
        let mut table = MappingTable::new(u64::from(u32::MAX));
        let (id, dev) = table.map(0x8000_0120, 0x20, DmaDirection::ToDevice).unwrap();
        assert_eq!(dev, 0x8000_0120);
        assert_eq!(table.check(dev + 0x10, 0x10, false), Ok(dev + 0x10));
        assert_eq!(
            table.check(dev, 4, true),
            Err(DmaError::AccessDenied { addr: dev })
        );
        table.unmap(id);
        assert_eq!(
            table.check(dev, 4, false),
            Err(DmaError::NotMapped { addr: dev })
        );
    }

    #[test]
    fn mapping_respects_mask() {
        let mut table = MappingTable::new(0x7fff_ffff);
        assert_eq!(
            table.map(0x8000_0000, 0x100, DmaDirection::FromDevice),
            Err(DmaError::BeyondMask {
                addr: 0x8000_0000,
                mask: 0x7fff_ffff
            })
        );
        table.map(0x4000_0000, 0x100, DmaDirection::FromDevice).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn access_must_stay_inside_one_mapping() {
        let mut table = MappingTable::new(u64::from(u32::MAX));
        table.map(0x8000_0000, 0x40, DmaDirection::Bidirectional).unwrap();
        assert!(table.check(0x8000_0030, 0x20, false).is_err());
        assert!(table.check(0x8000_0000, 0x40, true).is_ok());
    }
}
