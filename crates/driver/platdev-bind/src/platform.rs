//! The seam between the binder and the hardware it hands out.
//!
//! Each [`Platform`] method performs one primitive hardware operation and
//! knows nothing about ownership; exclusivity and release bookkeeping live in
//! the [`Binder`](crate::Binder).

use core::fmt;
use std::sync::Arc;

use crate::spec::{GpioDirection, TriggerFlags};

/// Access width of a register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 8 bits.
    U8,
    /// 16 bits.
    U16,
    /// 32 bits.
    U32,
    /// 64 bits.
    U64,
}

impl Width {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// Errors reported by a [`Platform`] primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// No resource with that name exists.
    NotFound,
    /// The line number is beyond what the controller provides.
    InvalidLine(u32),
    /// The request is malformed (e.g. a zero-length window).
    InvalidArgument(&'static str),
    /// The controller does not support the requested mode.
    Unsupported,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::InvalidLine(line) => write!(f, "no such line {line}"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::Unsupported => f.write_str("unsupported"),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Raw register access for one mapped window. Offsets are relative to the
/// window base and already bounds-checked by the caller.
pub trait RegisterIo: Send + Sync {
    /// Reads a register.
    fn read(&self, offset: u64, width: Width) -> u64;
    /// Writes a register.
    fn write(&self, offset: u64, width: Width, value: u64);
}

/// Hardware primitives the binder needs.
pub trait Platform: Send + Sync {
    /// Maps `length` bytes of registers at bus address `base`.
    ///
    /// # Errors
    ///
    /// Returns a [`PlatformError`] if the window cannot be mapped.
    fn map_mmio(&self, base: u64, length: u64) -> Result<Arc<dyn RegisterIo>, PlatformError>;

    /// Unmaps a window previously returned by [`map_mmio`](Self::map_mmio).
    fn unmap_mmio(&self, base: u64, length: u64);

    /// Programs the trigger mode of an interrupt line.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidLine`] for lines the controller lacks.
    fn configure_irq(&self, line: u32, trigger: TriggerFlags) -> Result<(), PlatformError>;

    /// Returns an interrupt line to its reset configuration.
    fn release_irq(&self, line: u32);

    /// Claims a GPIO line in the given direction.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidLine`] for lines the controller lacks.
    fn gpio_request(&self, line: u32, direction: GpioDirection) -> Result<(), PlatformError>;

    /// Returns a GPIO line to the controller.
    fn gpio_free(&self, line: u32);

    /// Drives an output line.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidLine`] for lines the controller lacks.
    fn gpio_set(&self, line: u32, high: bool) -> Result<(), PlatformError>;

    /// Samples a line.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidLine`] for lines the controller lacks.
    fn gpio_get(&self, line: u32) -> Result<bool, PlatformError>;

    /// Ungates a clock.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NotFound`] for unknown clocks.
    fn clock_enable(&self, name: &str) -> Result<(), PlatformError>;

    /// Gates a clock.
    fn clock_disable(&self, name: &str);

    /// Programs a clock rate.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NotFound`] for unknown clocks.
    fn clock_set_rate(&self, name: &str, rate: u64) -> Result<(), PlatformError>;

    /// Turns a regulator on.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NotFound`] for unknown regulators.
    fn regulator_enable(&self, name: &str) -> Result<(), PlatformError>;

    /// Turns a regulator off.
    fn regulator_disable(&self, name: &str);

    /// Programs a regulator output voltage.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NotFound`] for unknown regulators.
    fn regulator_set_voltage(&self, name: &str, microvolt: u32) -> Result<(), PlatformError>;
}
