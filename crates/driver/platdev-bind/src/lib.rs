//! `platdev-bind` --- hardware resource binding.
//!
//! Turns the resource properties of a hardware node into owned resources:
//!
//! 1. [`decode_specs`] reads `reg`, `interrupts`, GPIO, clock and supply
//!    properties into [`ResourceSpec`]s.
//! 2. [`Binder::acquire_all`] claims them through a [`Platform`], checking
//!    ownership so no two devices drive the same registers or GPIO line.
//! 3. The resulting [`ResourceSet`] gives everything back, newest first,
//!    when the device is removed or the set is dropped.
//!
//! [`SimPlatform`] is a complete software platform for hosts and tests.

mod binder;
pub mod mmio;
pub mod platform;
pub mod resource;
pub mod sim;
pub mod spec;

use core::fmt;

use platdev_core::DeviceId;
use platdev_devtree::DirectoryError;

pub use binder::{AcquireReport, Binder};
pub use mmio::{MmioError, MmioWindow};
pub use platform::{Platform, PlatformError, RegisterIo, Width};
pub use resource::{BoundResource, GpioHandle, ResourceHandle, ResourceId, ResourceSet};
pub use sim::{PlatformCall, SimPlatform};
pub use spec::{
    GpioDirection, GpioFlags, ResourceClass, ResourceSpec, TriggerFlags, decode_specs,
};

/// Errors from resource acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The resource is held by another device.
    ResourceConflict {
        /// What was requested.
        resource: ResourceSpec,
        /// Current holder.
        holder: DeviceId,
    },
    /// The platform could not provide a required resource.
    Unavailable {
        /// What was requested.
        resource: ResourceSpec,
        /// Platform error.
        cause: PlatformError,
    },
    /// An optional resource (clock or regulator) is absent. The device can
    /// run without it.
    OptionalMissing {
        /// What was requested.
        resource: ResourceSpec,
        /// Platform error.
        cause: PlatformError,
    },
    /// The node's resource properties could not be decoded.
    Directory(DirectoryError),
}

impl BindError {
    /// `false` only for [`BindError::OptionalMissing`].
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::OptionalMissing { .. })
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceConflict { resource, holder } => {
                write!(f, "{resource} is already held by {holder}")
            }
            Self::Unavailable { resource, cause } => {
                write!(f, "cannot acquire {resource}: {cause}")
            }
            Self::OptionalMissing { resource, cause } => {
                write!(f, "optional {resource} unavailable: {cause}")
            }
            Self::Directory(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unavailable { cause, .. } | Self::OptionalMissing { cause, .. } => Some(cause),
            Self::Directory(err) => Some(err),
            Self::ResourceConflict { .. } => None,
        }
    }
}

impl From<DirectoryError> for BindError {
    fn from(err: DirectoryError) -> Self {
        Self::Directory(err)
    }
}
