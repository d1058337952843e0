//! Driver trait, descriptors, and device states.

use core::fmt;
use std::sync::Arc;

use platdev_devtree::DriverMatch;

use crate::ProbeError;
use crate::context::ProbeContext;

/// Lifecycle state of a device.
///
/// Tracked by the [`DeviceManager`](crate::DeviceManager), never by the
/// driver itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// No driver is bound.
    Unbound,
    /// Resources are being acquired and the driver is initializing.
    Probing,
    /// Bound and running.
    Active,
    /// Going to sleep: snapshot, interrupts off, DMA quiesced, power off.
    Suspending,
    /// Asleep. Its handlers are disabled and clocks and regulators are off.
    Suspended,
    /// Waking: power first, then driver state, then interrupts.
    Resuming,
    /// Being torn down.
    Removing,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unbound => "unbound",
            Self::Probing => "probing",
            Self::Active => "active",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Resuming => "resuming",
            Self::Removing => "removing",
        })
    }
}

/// A device driver.
///
/// By the time [`probe`](Self::probe) runs, every resource the node
/// describes has been acquired and is reachable through the context.
pub trait Driver: Send + Sync {
    /// Initializes a matched device and returns its private state.
    ///
    /// Interrupt handlers registered and completion signals created through
    /// `ctx` are owned by the device and torn down with it.
    ///
    /// # Errors
    ///
    /// Any error fails the probe. The manager then unregisters the
    /// handlers, releases the resources, and leaves the node unbound.
    fn probe(&self, ctx: &mut ProbeContext<'_>) -> Result<Box<dyn DeviceOps>, ProbeError>;
}

/// Per-device private state and its lifecycle hooks.
///
/// Every hook has a no-op default, so simple drivers implement none.
pub trait DeviceOps: Send {
    /// Saves whatever [`resume`](Self::resume) needs. Runs before its
    /// handlers are disabled and power is removed.
    ///
    /// # Errors
    ///
    /// An error aborts the suspend; the device stays active.
    fn suspend(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Restores the device. Runs after power is back and before its
    /// handlers are enabled.
    ///
    /// # Errors
    ///
    /// An error leaves the device suspended.
    fn resume(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Quiesces the hardware. Runs after the device's interrupt handlers
    /// are gone and before its resources are released.
    fn remove(&mut self) {}
}

/// A registered driver: its name, the compatible identifiers it supports,
/// and the driver itself.
#[derive(Clone)]
pub struct DriverDescriptor {
    name: &'static str,
    compatible: &'static [&'static str],
    driver: Arc<dyn Driver>,
}

impl fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDescriptor")
            .field("name", &self.name)
            .field("compatible", &self.compatible)
            .finish_non_exhaustive()
    }
}

impl DriverDescriptor {
    /// Creates a descriptor.
    pub fn new(
        name: &'static str,
        compatible: &'static [&'static str],
        driver: impl Driver + 'static,
    ) -> Self {
        Self {
            name,
            compatible,
            driver: Arc::new(driver),
        }
    }

    /// The driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl DriverMatch for DriverDescriptor {
    fn name(&self) -> &str {
        self.name
    }

    fn compatible(&self) -> &[&str] {
        self.compatible
    }
}
