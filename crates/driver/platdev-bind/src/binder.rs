//! Ownership-tracking resource acquisition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use platdev_core::{DeviceId, Event, EventKind, EventSink};

use crate::BindError;
use crate::mmio::{MmioWindow, ranges_overlap};
use crate::platform::Platform;
use crate::resource::{BoundResource, GpioHandle, PowerHooks, ResourceHandle, ResourceId, ResourceSet};
use crate::spec::{GpioDirection, ResourceSpec, TriggerFlags};

#[derive(Debug, Clone, Copy)]
struct MemoryClaim {
    id: ResourceId,
    owner: DeviceId,
    base: u64,
    length: u64,
}

#[derive(Debug)]
struct IrqClaim {
    trigger: TriggerFlags,
    holders: Vec<(DeviceId, ResourceId)>,
}

#[derive(Debug, Default)]
struct Claims {
    memory: Vec<MemoryClaim>,
    gpio: BTreeMap<u32, (DeviceId, ResourceId)>,
    irq: BTreeMap<u32, IrqClaim>,
}

struct BinderInner {
    platform: Arc<dyn Platform>,
    events: Arc<dyn EventSink>,
    claims: Mutex<Claims>,
    next_id: AtomicU64,
}

/// Outcome of a successful [`Binder::acquire_all`].
#[derive(Debug, Default)]
pub struct AcquireReport {
    /// Number of resources bound.
    pub acquired: usize,
    /// Optional resources that could not be bound.
    pub warnings: Vec<BindError>,
}

/// Hands out hardware resources and keeps track of who holds what.
///
/// Cheap to clone; clones share the claim table.
#[derive(Clone)]
pub struct Binder {
    inner: Arc<BinderInner>,
}

impl core::fmt::Debug for Binder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Binder")
            .field("claims", &*self.inner.claims.lock())
            .finish_non_exhaustive()
    }
}

impl Binder {
    /// Creates a binder over `platform`, reporting anomalies to `events`.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(BinderInner {
                platform,
                events,
                claims: Mutex::new(Claims::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The platform resources are acquired from.
    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    /// Number of claims currently held by `owner`.
    #[must_use]
    pub fn claims_held_by(&self, owner: DeviceId) -> usize {
        let claims = self.inner.claims.lock();
        claims.memory.iter().filter(|c| c.owner == owner).count()
            + claims.gpio.values().filter(|(o, _)| *o == owner).count()
            + claims
                .irq
                .values()
                .map(|c| c.holders.iter().filter(|(o, _)| *o == owner).count())
                .sum::<usize>()
    }

    fn next_id(&self) -> ResourceId {
        ResourceId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquires one resource into `owner`.
    ///
    /// # Errors
    ///
    /// - [`BindError::ResourceConflict`] if another owner holds the resource
    ///   (or, for interrupt lines, holds it with a different trigger mode).
    /// - [`BindError::Unavailable`] if the platform refuses a required
    ///   resource.
    /// - [`BindError::OptionalMissing`] if a clock or regulator is not
    ///   available. Not fatal; nothing was added to `owner`.
    pub fn acquire<'s>(
        &self,
        spec: &ResourceSpec,
        owner: &'s mut ResourceSet,
    ) -> Result<&'s BoundResource, BindError> {
        let result = match spec {
            ResourceSpec::MemoryWindow { base, length } => {
                self.bind_memory(spec, *base, *length, owner.owner())
            }
            ResourceSpec::InterruptLine { line, trigger } => {
                self.bind_irq(spec, *line, *trigger, owner.owner())
            }
            ResourceSpec::GpioLine {
                line, direction, ..
            } => self.bind_gpio(spec, *line, *direction, owner.owner()),
            ResourceSpec::ClockRequest { name, rate } => self.bind_clock(spec, name, *rate),
            ResourceSpec::RegulatorRequest { name, microvolt } => {
                self.bind_regulator(spec, name, *microvolt)
            }
        };

        match result {
            Ok(resource) => {
                log::debug!(target: "platdev::bind", "{}: bound {spec}", owner.owner());
                Ok(owner.push(resource))
            }
            Err(err) => {
                let kind = if err.is_fatal() {
                    log::warn!(target: "platdev::bind", "{}: {err}", owner.owner());
                    EventKind::ResourceAcquisitionFailed
                } else {
                    log::warn!(target: "platdev::bind", "{}: continuing without {spec}: {err}", owner.owner());
                    EventKind::OptionalResourceMissing
                };
                self.inner
                    .events
                    .emit(Event::new(kind, err.to_string()).with_device(Some(owner.owner())));
                Err(err)
            }
        }
    }

    /// Acquires every spec into `owner`: memory windows first, then
    /// interrupts, GPIOs, and finally clocks and regulators.
    ///
    /// A fatal failure releases everything this call acquired, newest first,
    /// before the error is returned. Missing optional resources are reported
    /// in the [`AcquireReport`].
    ///
    /// # Errors
    ///
    /// The first fatal [`BindError`].
    pub fn acquire_all(
        &self,
        specs: &[ResourceSpec],
        owner: &mut ResourceSet,
    ) -> Result<AcquireReport, BindError> {
        let checkpoint = owner.len();
        let mut ordered: Vec<&ResourceSpec> = specs.iter().collect();
        ordered.sort_by_key(|s| s.class());

        let mut report = AcquireReport::default();
        for spec in ordered {
            match self.acquire(spec, owner) {
                Ok(_) => report.acquired += 1,
                Err(err) if !err.is_fatal() => report.warnings.push(err),
                Err(err) => {
                    let rolled_back = owner.len() - checkpoint;
                    owner.truncate(checkpoint);
                    log::debug!(
                        target: "platdev::bind",
                        "{}: rolled back {rolled_back} resources",
                        owner.owner()
                    );
                    return Err(err);
                }
            }
        }
        Ok(report)
    }

    /// Releases everything `owner` holds, newest first.
    pub fn release_all(&self, owner: &mut ResourceSet) -> usize {
        owner.release_all()
    }

    // ---- Per-class binding --------------------------------------------------

    fn bind_memory(
        &self,
        spec: &ResourceSpec,
        base: u64,
        length: u64,
        owner: DeviceId,
    ) -> Result<BoundResource, BindError> {
        let mut claims = self.inner.claims.lock();
        if let Some(held) = claims
            .memory
            .iter()
            .find(|c| c.owner != owner && ranges_overlap(c.base, c.length, base, length))
        {
            return Err(BindError::ResourceConflict {
                resource: spec.clone(),
                holder: held.owner,
            });
        }
        let io = self
            .inner
            .platform
            .map_mmio(base, length)
            .map_err(|cause| BindError::Unavailable {
                resource: spec.clone(),
                cause,
            })?;
        let id = self.next_id();
        claims.memory.push(MemoryClaim {
            id,
            owner,
            base,
            length,
        });
        drop(claims);

        let inner = Arc::clone(&self.inner);
        let release = Box::new(move || {
            inner.claims.lock().memory.retain(|c| c.id != id);
            inner.platform.unmap_mmio(base, length);
        });
        Ok(BoundResource::new(
            id,
            spec.clone(),
            ResourceHandle::Memory(MmioWindow::new(base, length, io)),
            release,
            None,
        ))
    }

    fn bind_irq(
        &self,
        spec: &ResourceSpec,
        line: u32,
        trigger: TriggerFlags,
        owner: DeviceId,
    ) -> Result<BoundResource, BindError> {
        let unavailable = |cause| BindError::Unavailable {
            resource: spec.clone(),
            cause,
        };
        let id = self.next_id();
        let mut claims = self.inner.claims.lock();
        let programmed = match claims.irq.get_mut(&line) {
            Some(claim) => {
                if !trigger.is_empty() && !claim.trigger.is_empty() && claim.trigger != trigger {
                    return Err(BindError::ResourceConflict {
                        resource: spec.clone(),
                        holder: claim.holders.first().map_or(owner, |(o, _)| *o),
                    });
                }
                if claim.trigger.is_empty() && !trigger.is_empty() {
                    self.inner
                        .platform
                        .configure_irq(line, trigger)
                        .map_err(unavailable)?;
                    claim.trigger = trigger;
                }
                claim.holders.push((owner, id));
                claim.trigger
            }
            None => {
                self.inner
                    .platform
                    .configure_irq(line, trigger)
                    .map_err(unavailable)?;
                claims.irq.insert(
                    line,
                    IrqClaim {
                        trigger,
                        holders: vec![(owner, id)],
                    },
                );
                trigger
            }
        };
        drop(claims);

        let inner = Arc::clone(&self.inner);
        let release = Box::new(move || {
            let mut claims = inner.claims.lock();
            let last = match claims.irq.get_mut(&line) {
                Some(claim) => {
                    claim.holders.retain(|(_, h)| *h != id);
                    claim.holders.is_empty()
                }
                None => false,
            };
            if last {
                claims.irq.remove(&line);
                drop(claims);
                inner.platform.release_irq(line);
            }
        });
        Ok(BoundResource::new(
            id,
            spec.clone(),
            ResourceHandle::Interrupt {
                line,
                trigger: programmed,
            },
            release,
            None,
        ))
    }

    fn bind_gpio(
        &self,
        spec: &ResourceSpec,
        line: u32,
        direction: GpioDirection,
        owner: DeviceId,
    ) -> Result<BoundResource, BindError> {
        let mut claims = self.inner.claims.lock();
        if let Some((holder, _)) = claims.gpio.get(&line) {
            return Err(BindError::ResourceConflict {
                resource: spec.clone(),
                holder: *holder,
            });
        }
        self.inner
            .platform
            .gpio_request(line, direction)
            .map_err(|cause| BindError::Unavailable {
                resource: spec.clone(),
                cause,
            })?;
        let id = self.next_id();
        claims.gpio.insert(line, (owner, id));
        drop(claims);

        let inner = Arc::clone(&self.inner);
        let release = Box::new(move || {
            inner.claims.lock().gpio.remove(&line);
            inner.platform.gpio_free(line);
        });
        Ok(BoundResource::new(
            id,
            spec.clone(),
            ResourceHandle::Gpio(GpioHandle::new(
                line,
                direction,
                Arc::clone(&self.inner.platform),
            )),
            release,
            None,
        ))
    }

    fn bind_clock(
        &self,
        spec: &ResourceSpec,
        name: &str,
        rate: Option<u64>,
    ) -> Result<BoundResource, BindError> {
        let platform = &self.inner.platform;
        let missing = |cause| BindError::OptionalMissing {
            resource: spec.clone(),
            cause,
        };
        platform.clock_enable(name).map_err(missing)?;
        if let Some(rate) = rate {
            if let Err(cause) = platform.clock_set_rate(name, rate) {
                platform.clock_disable(name);
                return Err(missing(cause));
            }
        }

        let (off_platform, on_platform) = (Arc::clone(platform), Arc::clone(platform));
        let (off_name, on_name) = (name.to_owned(), name.to_owned());
        let hooks = PowerHooks {
            off: Box::new(move || off_platform.clock_disable(&off_name)),
            on: Box::new(move || on_platform.clock_enable(&on_name)),
        };
        Ok(BoundResource::new(
            self.next_id(),
            spec.clone(),
            ResourceHandle::Clock {
                name: name.to_owned(),
            },
            Box::new(|| {}),
            Some(hooks),
        ))
    }

    fn bind_regulator(
        &self,
        spec: &ResourceSpec,
        name: &str,
        microvolt: Option<u32>,
    ) -> Result<BoundResource, BindError> {
        let platform = &self.inner.platform;
        let missing = |cause| BindError::OptionalMissing {
            resource: spec.clone(),
            cause,
        };
        if let Some(uv) = microvolt {
            platform.regulator_set_voltage(name, uv).map_err(missing)?;
        }
        platform.regulator_enable(name).map_err(missing)?;

        let (off_platform, on_platform) = (Arc::clone(platform), Arc::clone(platform));
        let (off_name, on_name) = (name.to_owned(), name.to_owned());
        let hooks = PowerHooks {
            off: Box::new(move || off_platform.regulator_disable(&off_name)),
            on: Box::new(move || on_platform.regulator_enable(&on_name)),
        };
        Ok(BoundResource::new(
            self.next_id(),
            spec.clone(),
            ResourceHandle::Regulator {
                name: name.to_owned(),
            },
            Box::new(|| {}),
            Some(hooks),
        ))
    }
}
