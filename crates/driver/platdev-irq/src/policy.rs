//! Registration policies and handler return values.

use core::time::Duration;

use platdev_core::DeviceId;

/// What an immediate handler did with an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was ours and is fully handled.
    Handled,
    /// The interrupt was not raised by our device.
    NotMine,
    /// The interrupt was ours; run the deferred handler.
    WakeDeferred,
}

impl IrqReturn {
    /// `true` for [`Handled`](Self::Handled) and
    /// [`WakeDeferred`](Self::WakeDeferred).
    #[must_use]
    pub fn is_claimed(self) -> bool {
        !matches!(self, Self::NotMine)
    }
}

/// Whether a line can have more than one holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sharing {
    /// Sole holder of the line.
    #[default]
    Exclusive,
    /// Line may be shared with other `Shared` registrations.
    Shared,
}

/// Where the deferred handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threading {
    /// On the dispatcher's shared worker pool.
    #[default]
    None,
    /// On a thread dedicated to this registration.
    Always,
    /// On a dedicated thread, with the line masked from `WakeDeferred`
    /// until the deferred handler returns.
    OneShot,
}

impl Threading {
    /// `true` for policies that need a dedicated thread.
    #[must_use]
    pub fn is_dedicated(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// How a registration wants its interrupts delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqPolicy {
    /// Line sharing.
    pub sharing: Sharing,
    /// Deferred execution context.
    pub threading: Threading,
    /// Coalescing interval. `None` uses the dispatcher default, which only
    /// applies to non-one-shot registrations with a deferred handler.
    pub coalesce: Option<Duration>,
    /// Device named in events about this registration.
    pub device: Option<DeviceId>,
}

impl IrqPolicy {
    /// Exclusive line, deferred work on the shared pool.
    #[must_use]
    pub fn exclusive() -> Self {
        Self::default()
    }

    /// Shared line, deferred work on the shared pool.
    #[must_use]
    pub fn shared() -> Self {
        Self {
            sharing: Sharing::Shared,
            ..Self::default()
        }
    }

    /// Sets the threading policy.
    #[must_use]
    pub fn threading(mut self, threading: Threading) -> Self {
        self.threading = threading;
        self
    }

    /// Coalesces deferred work into one run per `interval`.
    #[must_use]
    pub fn coalesce(mut self, interval: Duration) -> Self {
        self.coalesce = Some(interval);
        self
    }

    /// Attributes events to `device`.
    #[must_use]
    pub fn for_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }
}
