//! The device manager and its per-device records.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use platdev_bind::{Binder, Platform, ResourceSet, decode_specs};
use platdev_core::config::{Config, LifecycleConfig};
use platdev_core::event::EventSink;
use platdev_core::id::{DeviceId, DeviceIdAllocator};
use platdev_core::sync::WaitOutcome;
use platdev_devtree::{DeviceTree, DriverMatch, DriverTable, NodeRef};
use platdev_dma::DmaEngine;
use platdev_irq::IrqDispatcher;

use crate::context::{ProbeContext, Tracked};
use crate::driver::{DeviceOps, DeviceState, DriverDescriptor};
use crate::{LifecycleError, ProbeError};

/// Snapshot of one bound device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device id.
    pub id: DeviceId,
    /// Node path.
    pub path: String,
    /// Name of the bound driver.
    pub driver: String,
    /// Current state.
    pub state: DeviceState,
}

/// Outcome of probing one node during [`DeviceManager::probe_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRecord {
    /// Node path.
    pub path: String,
    /// The new device, or why the node stayed unbound.
    pub result: Result<DeviceId, LifecycleError>,
}

/// Everything a bound device owns. Guarded by the record's instance lock,
/// which serializes lifecycle operations on the device.
struct Instance {
    ops: Option<Box<dyn DeviceOps>>,
    resources: ResourceSet,
    tracked: Tracked,
}

struct DeviceRecord {
    id: DeviceId,
    path: String,
    driver: String,
    state: Mutex<DeviceState>,
    instance: Mutex<Instance>,
}

impl DeviceRecord {
    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn set_state(&self, to: DeviceState) {
        *self.state.lock() = to;
    }

    /// Moves `from` → `to`, or reports the state that blocked `operation`.
    fn transition(
        &self,
        from: DeviceState,
        to: DeviceState,
        operation: &'static str,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(LifecycleError::InvalidState {
                device: self.id,
                state: *state,
                operation,
            });
        }
        *state = to;
        Ok(())
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            path: self.path.clone(),
            driver: self.driver.clone(),
            state: self.state(),
        }
    }
}

/// Matches hardware nodes to drivers and runs each device through probe,
/// suspend, resume, and removal.
///
/// The manager owns the interrupt dispatcher and the DMA engine; every
/// device shares them. Devices are kept in probe order.
pub struct DeviceManager {
    tree: Arc<DeviceTree>,
    binder: Binder,
    irq: IrqDispatcher,
    dma: DmaEngine,
    events: Arc<dyn EventSink>,
    lifecycle: LifecycleConfig,
    drivers: RwLock<DriverTable<DriverDescriptor>>,
    devices: Mutex<Vec<Arc<DeviceRecord>>>,
    ids: DeviceIdAllocator,
}

impl core::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("drivers", &self.drivers.read().len())
            .field("devices", &self.devices.lock().len())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Creates a manager for `tree` on `platform`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Startup`] if the interrupt dispatcher or the DMA
    /// engine rejects the configuration.
    pub fn new(
        tree: DeviceTree,
        platform: Arc<dyn Platform>,
        config: &Config,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, LifecycleError> {
        let irq = IrqDispatcher::new(&config.irq, Arc::clone(&events))
            .map_err(|e| LifecycleError::Startup(e.into()))?;
        let dma = DmaEngine::new(&config.dma, Arc::clone(&events))
            .map_err(|e| LifecycleError::Startup(e.into()))?;
        Ok(Self {
            tree: Arc::new(tree),
            binder: Binder::new(platform, Arc::clone(&events)),
            irq,
            dma,
            events,
            lifecycle: config.lifecycle.clone(),
            drivers: RwLock::new(DriverTable::new()),
            devices: Mutex::new(Vec::new()),
            ids: DeviceIdAllocator::new(),
        })
    }

    /// Parses a flattened device tree blob and creates a manager for it.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Startup`] if the blob does not parse, otherwise as
    /// [`new`](Self::new).
    pub fn from_dtb(
        dtb: &[u8],
        platform: Arc<dyn Platform>,
        config: &Config,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, LifecycleError> {
        let tree = DeviceTree::parse(dtb).map_err(|e| LifecycleError::Startup(e.into()))?;
        Self::new(tree, platform, config, events)
    }

    /// The hardware tree.
    #[must_use]
    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    /// The resource binder.
    #[must_use]
    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    /// The interrupt dispatcher.
    #[must_use]
    pub fn irq(&self) -> &IrqDispatcher {
        &self.irq
    }

    /// The DMA engine.
    #[must_use]
    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    // ---- Driver registration ------------------------------------------------

    /// Adds a driver to the match table. Nodes already probed are not
    /// revisited; call [`probe_all`](Self::probe_all) again to pick them up.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::DuplicateDriver`] if the name is taken.
    pub fn register_driver(&self, descriptor: DriverDescriptor) -> Result<(), LifecycleError> {
        let mut drivers = self.drivers.write();
        if drivers.get(descriptor.name()).is_some() {
            return Err(LifecycleError::DuplicateDriver(descriptor.name().to_owned()));
        }
        log::debug!(
            target: "platdev::driver",
            "registered driver {} ({})",
            descriptor.name(),
            descriptor.compatible().join(", ")
        );
        drivers.push(descriptor);
        Ok(())
    }

    /// Removes a driver and every device bound to it, newest first. Returns
    /// the number of devices removed; unknown names remove nothing.
    pub fn unregister_driver(&self, name: &str) -> usize {
        if self.drivers.write().remove(name).is_none() {
            return 0;
        }
        let bound: Vec<DeviceId> = self
            .devices
            .lock()
            .iter()
            .rev()
            .filter(|r| r.driver == name)
            .map(|r| r.id)
            .collect();
        let removed = bound.into_iter().filter(|id| self.remove(*id)).count();
        log::debug!(target: "platdev::driver", "unregistered driver {name}, removed {removed} devices");
        removed
    }

    // ---- Probe --------------------------------------------------------------

    /// Binds a driver to the node at `path`.
    ///
    /// The node is matched against the driver table, every resource it
    /// describes is acquired, and the driver's probe runs. On failure all of
    /// it is undone and the node stays unbound.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::NodeNotFound`], [`LifecycleError::NodeDisabled`]
    ///   or [`LifecycleError::AlreadyBound`] before anything is attempted.
    /// - [`LifecycleError::Probe`] wrapping the failure otherwise, including
    ///   [`DirectoryError::NoMatchingDriver`](platdev_devtree::DirectoryError::NoMatchingDriver).
    pub fn probe_node(&self, path: &str) -> Result<DeviceId, LifecycleError> {
        let node = self
            .tree
            .find(path)
            .ok_or_else(|| LifecycleError::NodeNotFound(path.to_owned()))?;
        if !node.node().is_enabled() {
            return Err(LifecycleError::NodeDisabled(path.to_owned()));
        }
        let path = node.path().to_owned();

        let (record, descriptor) = {
            let mut devices = self.devices.lock();
            if let Some(bound) = devices.iter().find(|r| r.path == path) {
                return Err(LifecycleError::AlreadyBound {
                    path,
                    device: bound.id,
                });
            }
            let descriptor = match self.drivers.read().match_node(node.node()) {
                Ok(descriptor) => descriptor.clone(),
                Err(err) => {
                    log::debug!(target: "platdev::driver", "{path}: {err}");
                    return Err(LifecycleError::Probe {
                        path,
                        error: err.into(),
                    });
                }
            };
            let id = self.ids.allocate();
            let record = Arc::new(DeviceRecord {
                id,
                path: path.clone(),
                driver: descriptor.name().to_owned(),
                state: Mutex::new(DeviceState::Probing),
                instance: Mutex::new(Instance {
                    ops: None,
                    resources: ResourceSet::new(id),
                    tracked: Tracked::default(),
                }),
            });
            devices.push(Arc::clone(&record));
            (record, descriptor)
        };

        let id = record.id;
        log::debug!(target: "platdev::driver", "{path}: probing as {id} with {}", descriptor.name());
        let mut instance = record.instance.lock();
        match self.bind_and_probe(id, node, &descriptor, &mut instance) {
            Ok(()) => {
                drop(instance);
                record.set_state(DeviceState::Active);
                log::info!(target: "platdev::driver", "{path}: bound {id} to {}", descriptor.name());
                Ok(id)
            }
            Err(error) => {
                self.teardown(id, &mut instance);
                drop(instance);
                record.set_state(DeviceState::Unbound);
                self.forget(id);
                log::error!(target: "platdev::driver", "{path}: probe failed: {error}");
                Err(LifecycleError::Probe { path, error })
            }
        }
    }

    fn bind_and_probe(
        &self,
        id: DeviceId,
        node: NodeRef<'_>,
        descriptor: &DriverDescriptor,
        instance: &mut Instance,
    ) -> Result<(), ProbeError> {
        let specs = decode_specs(&self.tree, &node)?;
        let Instance {
            ops,
            resources,
            tracked,
            ..
        } = instance;
        let report = self.binder.acquire_all(&specs, resources)?;

        let mut ctx = ProbeContext {
            device: id,
            node,
            tree: &self.tree,
            binder: &self.binder,
            irq: &self.irq,
            dma: self.dma.for_device(id),
            events: &self.events,
            resources,
            tracked,
            warnings: &report.warnings,
        };
        *ops = Some(descriptor.driver().probe(&mut ctx)?);
        Ok(())
    }

    /// Probes every enabled node that has a `compatible` property and is not
    /// bound yet, depth-first from the root. Subtrees of disabled nodes are
    /// skipped.
    pub fn probe_all(&self) -> Vec<ProbeRecord> {
        let mut records = Vec::new();
        let mut disabled: Vec<String> = Vec::new();

        for node in self.tree.nodes() {
            let path = node.path();
            if disabled
                .iter()
                .any(|d| path.strip_prefix(d.as_str()).is_some_and(|r| r.starts_with('/')))
            {
                continue;
            }
            if !node.node().is_enabled() {
                disabled.push(path.to_owned());
                continue;
            }
            if node.node().compatible().is_empty() || self.device_at(path).is_some() {
                continue;
            }
            records.push(ProbeRecord {
                path: path.to_owned(),
                result: self.probe_node(path),
            });
        }

        let bound = records.iter().filter(|r| r.result.is_ok()).count();
        log::info!(
            target: "platdev::driver",
            "probed {} nodes, {bound} bound",
            records.len()
        );
        records
    }

    // ---- Power management ---------------------------------------------------

    /// Suspends an active device.
    ///
    /// The driver's suspend hook runs first, then the device's interrupt
    /// handlers are disabled (other holders of a shared line keep
    /// receiving interrupts), outstanding completion waits get until the quiesce
    /// timeout before they are cancelled, running handlers are waited for,
    /// and finally clocks and regulators are switched off.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::UnknownDevice`] or
    ///   [`LifecycleError::InvalidState`] if the device is not active.
    /// - [`LifecycleError::Hook`] if the driver refuses; the device stays
    ///   active.
    pub fn suspend(&self, id: DeviceId) -> Result<(), LifecycleError> {
        let record = self.record(id)?;
        let mut guard = record.instance.lock();
        let instance = &mut *guard;
        record.transition(DeviceState::Active, DeviceState::Suspending, "suspend")?;

        if let Some(ops) = instance.ops.as_mut() {
            if let Err(error) = ops.suspend() {
                record.set_state(DeviceState::Active);
                log::warn!(target: "platdev::driver", "{id}: suspend refused: {error}");
                return Err(LifecycleError::Hook { device: id, error });
            }
        }

        let disabled = instance.tracked.disable_irqs();
        let cancelled = self.quiesce(&instance.tracked);
        instance.tracked.synchronize_irqs();
        instance.resources.power_down();

        record.set_state(DeviceState::Suspended);
        log::info!(
            target: "platdev::driver",
            "{id}: suspended ({disabled} handlers disabled, {cancelled} waits cancelled)"
        );
        Ok(())
    }

    /// Waits for pending completion signals, sharing one quiesce timeout
    /// between them, and cancels whatever is still pending at the end.
    fn quiesce(&self, tracked: &Tracked) -> usize {
        let timeout = self.lifecycle.quiesce_timeout();
        let start = Instant::now();
        let mut cancelled = 0;
        for signal in &tracked.signals {
            let remaining = timeout.saturating_sub(start.elapsed());
            if signal.wait(remaining) == WaitOutcome::TimedOut && signal.cancel() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Resumes a suspended device: power first, then the driver's resume
    /// hook, then its interrupt handlers are enabled. An interrupt held
    /// while suspended is delivered once.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::UnknownDevice`] or
    ///   [`LifecycleError::InvalidState`] if the device is not suspended.
    /// - [`LifecycleError::Power`] or [`LifecycleError::Hook`]; the device
    ///   is powered down again and stays suspended.
    pub fn resume(&self, id: DeviceId) -> Result<(), LifecycleError> {
        let record = self.record(id)?;
        let mut guard = record.instance.lock();
        let instance = &mut *guard;
        record.transition(DeviceState::Suspended, DeviceState::Resuming, "resume")?;

        if let Err(cause) = instance.resources.power_up() {
            instance.resources.power_down();
            record.set_state(DeviceState::Suspended);
            log::warn!(target: "platdev::driver", "{id}: resume failed: {cause}");
            return Err(LifecycleError::Power { device: id, cause });
        }
        if let Some(ops) = instance.ops.as_mut() {
            if let Err(error) = ops.resume() {
                instance.resources.power_down();
                record.set_state(DeviceState::Suspended);
                log::warn!(target: "platdev::driver", "{id}: resume hook failed: {error}");
                return Err(LifecycleError::Hook { device: id, error });
            }
        }
        instance.tracked.enable_irqs();

        record.set_state(DeviceState::Active);
        log::info!(target: "platdev::driver", "{id}: resumed");
        Ok(())
    }

    // ---- Removal ------------------------------------------------------------

    /// Unbinds a device. Returns `false` if no device has this id, e.g.
    /// because it was already removed.
    ///
    /// Outstanding waits are cancelled and interrupt handlers unregistered
    /// before the driver's remove hook runs; resources are released after
    /// it, newest first.
    pub fn remove(&self, id: DeviceId) -> bool {
        let Some(record) = self.find(id) else {
            return false;
        };
        let mut instance = record.instance.lock();
        if record.state() == DeviceState::Unbound {
            return false;
        }
        record.set_state(DeviceState::Removing);
        self.teardown(id, &mut instance);
        drop(instance);
        record.set_state(DeviceState::Unbound);
        self.forget(id);
        log::info!(target: "platdev::driver", "{}: removed {id}", record.path);
        true
    }

    /// Removes every device in reverse probe order. Returns how many were
    /// removed.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<DeviceId> = self.devices.lock().iter().rev().map(|r| r.id).collect();
        ids.into_iter().filter(|id| self.remove(*id)).count()
    }

    /// Releases everything a device holds. Safe on a partially probed
    /// instance.
    fn teardown(&self, id: DeviceId, instance: &mut Instance) {
        let cancelled = instance.tracked.cancel_waits();
        instance.tracked.unregister_irqs(&self.irq);
        instance.tracked.signals.clear();

        let mut ops = instance.ops.take();
        if let Some(ops) = ops.as_mut() {
            ops.remove();
        }
        let released = self.binder.release_all(&mut instance.resources);
        drop(ops);
        log::debug!(
            target: "platdev::driver",
            "{id}: torn down ({cancelled} waits cancelled, {released} resources released)"
        );
    }

    // ---- Queries ------------------------------------------------------------

    /// State of a device; [`DeviceState::Unbound`] for unknown ids.
    #[must_use]
    pub fn state(&self, id: DeviceId) -> DeviceState {
        self.find(id).map_or(DeviceState::Unbound, |r| r.state())
    }

    /// Bound devices in probe order.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.lock().iter().map(|r| r.info()).collect()
    }

    /// The device bound to the node at `path`, if any.
    #[must_use]
    pub fn device_at(&self, path: &str) -> Option<DeviceId> {
        self.devices
            .lock()
            .iter()
            .find(|r| r.path == path)
            .map(|r| r.id)
    }

    fn find(&self, id: DeviceId) -> Option<Arc<DeviceRecord>> {
        self.devices.lock().iter().find(|r| r.id == id).cloned()
    }

    fn record(&self, id: DeviceId) -> Result<Arc<DeviceRecord>, LifecycleError> {
        self.find(id).ok_or(LifecycleError::UnknownDevice(id))
    }

    fn forget(&self, id: DeviceId) {
        self.devices.lock().retain(|r| r.id != id);
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
