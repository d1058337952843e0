//! Bound resources and their owner.
//!
//! A [`BoundResource`] carries the callback that gives it back. The callback
//! runs exactly once: on explicit release, on rollback, or when the resource
//! is dropped. A [`ResourceSet`] owns the resources of one device and
//! releases them in reverse acquisition order when it is released or
//! dropped.

use core::fmt;
use std::sync::Arc;

use platdev_core::DeviceId;

use crate::mmio::MmioWindow;
use crate::platform::{Platform, PlatformError};
use crate::spec::{GpioDirection, ResourceSpec, TriggerFlags};

/// Unique id of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub(crate) u64);

/// Handle on a claimed GPIO line.
#[derive(Clone)]
pub struct GpioHandle {
    line: u32,
    direction: GpioDirection,
    platform: Arc<dyn Platform>,
}

impl fmt::Debug for GpioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioHandle")
            .field("line", &self.line)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl GpioHandle {
    pub(crate) fn new(line: u32, direction: GpioDirection, platform: Arc<dyn Platform>) -> Self {
        Self {
            line,
            direction,
            platform,
        }
    }

    /// Controller line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Direction the line was requested in.
    #[must_use]
    pub fn direction(&self) -> GpioDirection {
        self.direction
    }

    /// Drives the line.
    ///
    /// # Errors
    ///
    /// Fails for input lines.
    pub fn set(&self, high: bool) -> Result<(), PlatformError> {
        self.platform.gpio_set(self.line, high)
    }

    /// Samples the line.
    ///
    /// # Errors
    ///
    /// Propagates controller errors.
    pub fn get(&self) -> Result<bool, PlatformError> {
        self.platform.gpio_get(self.line)
    }
}

/// What a bound resource gives its owner.
#[derive(Debug, Clone)]
pub enum ResourceHandle {
    /// A mapped register window.
    Memory(MmioWindow),
    /// An interrupt line configured with `trigger`.
    Interrupt {
        /// Line number.
        line: u32,
        /// Programmed trigger mode.
        trigger: TriggerFlags,
    },
    /// A claimed GPIO line.
    Gpio(GpioHandle),
    /// An enabled clock.
    Clock {
        /// Clock name.
        name: String,
    },
    /// An enabled regulator.
    Regulator {
        /// Regulator name.
        name: String,
    },
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Power gating hooks for clocks and regulators.
pub(crate) struct PowerHooks {
    pub(crate) off: Box<dyn Fn() + Send + Sync>,
    pub(crate) on: Box<dyn Fn() -> Result<(), PlatformError> + Send + Sync>,
}

/// A live hardware resource.
pub struct BoundResource {
    id: ResourceId,
    spec: ResourceSpec,
    handle: ResourceHandle,
    release: Option<ReleaseFn>,
    power: Option<PowerHooks>,
    powered: bool,
}

impl fmt::Debug for BoundResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundResource")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("released", &self.release.is_none())
            .finish_non_exhaustive()
    }
}

impl BoundResource {
    pub(crate) fn new(
        id: ResourceId,
        spec: ResourceSpec,
        handle: ResourceHandle,
        release: ReleaseFn,
        power: Option<PowerHooks>,
    ) -> Self {
        Self {
            id,
            spec,
            handle,
            release: Some(release),
            power,
            powered: true,
        }
    }

    /// Acquisition id.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The spec this resource satisfies.
    #[must_use]
    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    /// The owner-facing handle.
    #[must_use]
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// `true` until the release callback has run.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.release.is_some()
    }

    /// Runs the release callback if it has not run yet. Power resources are
    /// switched off first unless already suspended.
    pub fn release(&mut self) {
        if self.release.is_none() {
            return;
        }
        self.power_off();
        if let Some(release) = self.release.take() {
            if let ResourceHandle::Memory(window) = &self.handle {
                window.revoke();
            }
            release();
        }
    }

    fn power_off(&mut self) {
        if let Some(hooks) = &self.power {
            if self.powered && self.release.is_some() {
                (hooks.off)();
                self.powered = false;
            }
        }
    }

    fn power_on(&mut self) -> Result<(), PlatformError> {
        if let Some(hooks) = &self.power {
            if !self.powered && self.release.is_some() {
                (hooks.on)()?;
                self.powered = true;
            }
        }
        Ok(())
    }
}

impl Drop for BoundResource {
    fn drop(&mut self) {
        self.release();
    }
}

/// All resources held by one device.
#[derive(Debug)]
pub struct ResourceSet {
    owner: DeviceId,
    resources: Vec<BoundResource>,
}

impl ResourceSet {
    /// Creates an empty set owned by `owner`.
    #[must_use]
    pub fn new(owner: DeviceId) -> Self {
        Self {
            owner,
            resources: Vec::new(),
        }
    }

    /// The owning device.
    #[must_use]
    pub fn owner(&self) -> DeviceId {
        self.owner
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// `true` if the set holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterates over the resources in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = &BoundResource> {
        self.resources.iter()
    }

    pub(crate) fn push(&mut self, resource: BoundResource) -> &BoundResource {
        self.resources.push(resource);
        let last = self.resources.len() - 1;
        &self.resources[last]
    }

    /// Register windows in acquisition (i.e. `reg`) order.
    pub fn memory_windows(&self) -> impl Iterator<Item = &MmioWindow> {
        self.resources.iter().filter_map(|r| match &r.handle {
            ResourceHandle::Memory(w) => Some(w),
            _ => None,
        })
    }

    /// Interrupt lines in acquisition (i.e. `interrupts`) order.
    pub fn interrupt_lines(&self) -> impl Iterator<Item = (u32, TriggerFlags)> {
        self.resources.iter().filter_map(|r| match &r.handle {
            ResourceHandle::Interrupt { line, trigger } => Some((*line, *trigger)),
            _ => None,
        })
    }

    /// GPIO lines in acquisition order.
    pub fn gpio_lines(&self) -> impl Iterator<Item = &GpioHandle> {
        self.resources.iter().filter_map(|r| match &r.handle {
            ResourceHandle::Gpio(g) => Some(g),
            _ => None,
        })
    }

    /// Releases every resource acquired after the first `len`, newest first.
    pub fn truncate(&mut self, len: usize) {
        while self.resources.len() > len {
            if let Some(mut resource) = self.resources.pop() {
                resource.release();
            }
        }
    }

    /// Releases everything, newest first. Returns how many resources were
    /// released. Calling it again is a no-op.
    pub fn release_all(&mut self) -> usize {
        let count = self.resources.len();
        self.truncate(0);
        if count > 0 {
            log::debug!(
                target: "platdev::bind",
                "{}: released {count} resources",
                self.owner
            );
        }
        count
    }

    /// Gates clocks and turns off regulators, newest first.
    pub fn power_down(&mut self) {
        for resource in self.resources.iter_mut().rev() {
            resource.power_off();
        }
    }

    /// Restores power in acquisition order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failure; resources restored before it
    /// stay powered.
    pub fn power_up(&mut self) -> Result<(), PlatformError> {
        for resource in &mut self.resources {
            resource.power_on()?;
        }
        Ok(())
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.release_all();
    }
}
