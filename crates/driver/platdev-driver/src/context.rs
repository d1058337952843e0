//! What a driver sees while probing.

use std::sync::Arc;

use platdev_bind::{BindError, Binder, BoundResource, GpioHandle, MmioWindow, ResourceSet, ResourceSpec};
use platdev_core::event::{Event, EventKind, EventSink};
use platdev_core::id::DeviceId;
use platdev_core::sync::CompletionSignal;
use platdev_devtree::{DeviceTree, DirectoryError, HardwareNode, NodeRef};
use platdev_dma::DmaEngine;
use platdev_irq::{DeferredHandler, ImmediateHandler, IrqDispatcher, IrqPolicy, IrqRegistration};

use crate::ProbeError;

/// Interrupt registrations and completion signals owned by one device.
#[derive(Default)]
pub(crate) struct Tracked {
    pub(crate) irqs: Vec<IrqRegistration>,
    pub(crate) signals: Vec<Arc<CompletionSignal>>,
}

impl Tracked {
    /// Stops the device's handlers without touching other holders of a
    /// shared line. Returns how many registrations were disabled.
    pub(crate) fn disable_irqs(&self) -> usize {
        for registration in &self.irqs {
            registration.disable();
        }
        self.irqs.len()
    }

    /// Re-enables the device's handlers; held interrupts are delivered once.
    pub(crate) fn enable_irqs(&self) {
        for registration in &self.irqs {
            registration.enable();
        }
    }

    /// Waits for the device's running handlers and queued deferred work.
    pub(crate) fn synchronize_irqs(&self) {
        for registration in &self.irqs {
            registration.synchronize();
        }
    }

    /// Cancels every signal still pending. Returns how many were.
    pub(crate) fn cancel_waits(&self) -> usize {
        self.signals.iter().filter(|s| s.cancel()).count()
    }

    /// Unregisters handlers newest first, waiting for each to go idle.
    pub(crate) fn unregister_irqs(&mut self, irq: &IrqDispatcher) {
        while let Some(registration) = self.irqs.pop() {
            irq.unregister(registration);
        }
    }
}

/// Capabilities handed to [`Driver::probe`](crate::Driver::probe).
///
/// Everything obtained through the context is scoped to the device: the
/// manager releases it when the probe fails or the device is removed.
pub struct ProbeContext<'a> {
    pub(crate) device: DeviceId,
    pub(crate) node: NodeRef<'a>,
    pub(crate) tree: &'a DeviceTree,
    pub(crate) binder: &'a Binder,
    pub(crate) irq: &'a IrqDispatcher,
    pub(crate) dma: DmaEngine,
    pub(crate) events: &'a Arc<dyn EventSink>,
    pub(crate) resources: &'a mut ResourceSet,
    pub(crate) tracked: &'a mut Tracked,
    pub(crate) warnings: &'a [BindError],
}

impl<'a> ProbeContext<'a> {
    /// Id of the device being probed.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Full path of the node.
    #[must_use]
    pub fn path(&self) -> &str {
        self.node.path()
    }

    /// The node being probed.
    #[must_use]
    pub fn node(&self) -> &'a HardwareNode {
        self.node.node()
    }

    /// The node with its addressing context.
    #[must_use]
    pub fn node_ref(&self) -> &NodeRef<'a> {
        &self.node
    }

    /// The whole hardware tree, e.g. for following phandles.
    #[must_use]
    pub fn tree(&self) -> &'a DeviceTree {
        self.tree
    }

    /// Resources acquired for the device so far.
    #[must_use]
    pub fn resources(&self) -> &ResourceSet {
        self.resources
    }

    /// Optional resources (clocks, regulators) that could not be acquired.
    #[must_use]
    pub fn warnings(&self) -> &[BindError] {
        self.warnings
    }

    fn missing(&self, property: &str) -> ProbeError {
        ProbeError::Directory(DirectoryError::MissingRequiredProperty {
            node: self.node.node().name().to_owned(),
            property: property.to_owned(),
        })
    }

    /// The `index`-th register window from `reg`.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::MissingRequiredProperty`] if `reg` has fewer
    /// entries.
    pub fn mmio(&self, index: usize) -> Result<MmioWindow, ProbeError> {
        self.resources
            .memory_windows()
            .nth(index)
            .cloned()
            .ok_or_else(|| self.missing("reg"))
    }

    /// The `index`-th line from `interrupts`.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::MissingRequiredProperty`] if `interrupts` has
    /// fewer entries.
    pub fn irq_line(&self, index: usize) -> Result<u32, ProbeError> {
        self.resources
            .interrupt_lines()
            .nth(index)
            .map(|(line, _)| line)
            .ok_or_else(|| self.missing("interrupts"))
    }

    /// The `index`-th claimed GPIO line.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::MissingRequiredProperty`] if fewer lines were
    /// claimed.
    pub fn gpio(&self, index: usize) -> Result<GpioHandle, ProbeError> {
        self.resources
            .gpio_lines()
            .nth(index)
            .cloned()
            .ok_or_else(|| self.missing("gpios"))
    }

    /// Acquires a resource the node does not describe.
    ///
    /// # Errors
    ///
    /// The [`BindError`], including non-fatal
    /// [`BindError::OptionalMissing`].
    pub fn acquire(&mut self, spec: &ResourceSpec) -> Result<&BoundResource, ProbeError> {
        Ok(self.binder.acquire(spec, self.resources)?)
    }

    /// Registers handlers on the `index`-th interrupt line. The handlers
    /// are unregistered when the device goes away, before its DMA memory is
    /// freed. Events from the line are attributed to this device.
    ///
    /// Returns the line number.
    ///
    /// # Errors
    ///
    /// A missing line or any [`IrqError`](platdev_irq::IrqError).
    pub fn request_irq(
        &mut self,
        index: usize,
        immediate: ImmediateHandler,
        deferred: Option<DeferredHandler>,
        policy: IrqPolicy,
    ) -> Result<u32, ProbeError> {
        let line = self.irq_line(index)?;
        let registration =
            self.irq
                .register(line, immediate, deferred, policy.for_device(self.device))?;
        self.tracked.irqs.push(registration);
        Ok(line)
    }

    /// A completion signal for DMA transfers. Pending waits on it are
    /// cancelled when the device is suspended past the quiesce timeout or
    /// removed.
    pub fn completion(&mut self) -> Arc<CompletionSignal> {
        let signal = Arc::new(CompletionSignal::new());
        self.tracked.signals.push(Arc::clone(&signal));
        signal
    }

    /// The DMA engine; its events are attributed to this device.
    #[must_use]
    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    /// The interrupt dispatcher, e.g. for masking a line during setup.
    #[must_use]
    pub fn irq(&self) -> &IrqDispatcher {
        self.irq
    }

    /// Emits a monitoring event attributed to this device.
    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.events
            .emit(Event::new(kind, message).with_device(Some(self.device)));
    }
}
