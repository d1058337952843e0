//! `platdev-driver` --- device lifecycle management.
//!
//! A [`DeviceManager`] ties the other `platdev` crates together. It holds
//! the parsed hardware tree, the registered drivers, and one
//! [`Binder`](platdev_bind::Binder), [`IrqDispatcher`](platdev_irq::IrqDispatcher)
//! and [`DmaEngine`](platdev_dma::DmaEngine) shared by every device, and it
//! walks each device through its lifecycle:
//!
//! ```text
//! Unbound → Probing → Active ⇄ Suspending → Suspended → Resuming → Active
//!                        ↘ Removing → Unbound
//! ```
//!
//! Probing matches the node against the driver table, acquires every
//! resource the node describes, and finally calls [`Driver::probe`] with a
//! [`ProbeContext`]. Whatever fails, everything acquired so far is released
//! and the device ends up `Unbound` again.

mod context;
mod driver;
mod manager;

use core::fmt;

use platdev_bind::{BindError, PlatformError};
use platdev_core::DeviceId;
use platdev_devtree::DirectoryError;
use platdev_dma::DmaError;
use platdev_irq::IrqError;

pub use context::ProbeContext;
pub use driver::{DeviceOps, DeviceState, Driver, DriverDescriptor};
pub use manager::{DeviceInfo, DeviceManager, ProbeRecord};

/// Errors that fail a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The node could not be matched or a property was missing or mistyped.
    Directory(DirectoryError),
    /// A resource could not be acquired.
    Bind(BindError),
    /// An interrupt handler could not be registered.
    Irq(IrqError),
    /// A DMA allocation or mapping failed.
    Dma(DmaError),
    /// The driver gave up on the device.
    Driver(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(err) => write!(f, "{err}"),
            Self::Bind(err) => write!(f, "{err}"),
            Self::Irq(err) => write!(f, "{err}"),
            Self::Dma(err) => write!(f, "{err}"),
            Self::Driver(msg) => write!(f, "driver error: {msg}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Directory(err) => Some(err),
            Self::Bind(err) => Some(err),
            Self::Irq(err) => Some(err),
            Self::Dma(err) => Some(err),
            Self::Driver(_) => None,
        }
    }
}

impl From<DirectoryError> for ProbeError {
    fn from(err: DirectoryError) -> Self {
        Self::Directory(err)
    }
}

impl From<BindError> for ProbeError {
    fn from(err: BindError) -> Self {
        Self::Bind(err)
    }
}

impl From<IrqError> for ProbeError {
    fn from(err: IrqError) -> Self {
        Self::Irq(err)
    }
}

impl From<DmaError> for ProbeError {
    fn from(err: DmaError) -> Self {
        Self::Dma(err)
    }
}

/// Errors from [`DeviceManager`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The manager's interrupt or DMA subsystem could not be started, or
    /// the tree blob did not parse.
    Startup(ProbeError),
    /// A driver with this name is already registered.
    DuplicateDriver(String),
    /// No node at this path.
    NodeNotFound(String),
    /// The node has `status = "disabled"`.
    NodeDisabled(String),
    /// A device is already bound to the node.
    AlreadyBound {
        /// Node path.
        path: String,
        /// The bound device.
        device: DeviceId,
    },
    /// No bound device has this id.
    UnknownDevice(DeviceId),
    /// The operation is not valid in the device's current state.
    InvalidState {
        /// The device.
        device: DeviceId,
        /// Its state.
        state: DeviceState,
        /// What was attempted.
        operation: &'static str,
    },
    /// Probing the node failed; nothing stays bound.
    Probe {
        /// Node path.
        path: String,
        /// Why.
        error: ProbeError,
    },
    /// A driver suspend or resume hook failed; the device kept its state.
    Hook {
        /// The device.
        device: DeviceId,
        /// Why.
        error: ProbeError,
    },
    /// Power could not be restored on resume; the device stays suspended.
    Power {
        /// The device.
        device: DeviceId,
        /// Platform error.
        cause: PlatformError,
    },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup(err) => write!(f, "device manager failed to start: {err}"),
            Self::DuplicateDriver(name) => write!(f, "driver '{name}' is already registered"),
            Self::NodeNotFound(path) => write!(f, "no node at {path}"),
            Self::NodeDisabled(path) => write!(f, "{path} is disabled"),
            Self::AlreadyBound { path, device } => write!(f, "{path} is already bound to {device}"),
            Self::UnknownDevice(device) => write!(f, "no bound device {device}"),
            Self::InvalidState {
                device,
                state,
                operation,
            } => write!(f, "{device}: cannot {operation} while {state}"),
            Self::Probe { path, error } => write!(f, "probe of {path} failed: {error}"),
            Self::Hook { device, error } => write!(f, "{device}: driver hook failed: {error}"),
            Self::Power { device, cause } => write!(f, "{device}: power restore failed: {cause}"),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Startup(error) | Self::Probe { error, .. } | Self::Hook { error, .. } => {
                Some(error)
            }
            Self::Power { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
