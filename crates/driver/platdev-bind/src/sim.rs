//! Simulated platform.
//!
//! [`SimPlatform`] stands in for real hardware on hosts without any: register
//! windows are plain byte arrays, the GPIO controller has a fixed number of
//! lines, and clocks/regulators are named entries with reference-counted
//! enables. Every primitive call is recorded in order so tests can assert
//! acquisition and release sequences.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::platform::{Platform, PlatformError, RegisterIo, Width};
use crate::spec::{GpioDirection, TriggerFlags};

/// One recorded primitive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    /// [`Platform::map_mmio`].
    MapMmio {
        /// Window base.
        base: u64,
        /// Window length.
        length: u64,
    },
    /// [`Platform::unmap_mmio`].
    UnmapMmio {
        /// Window base.
        base: u64,
    },
    /// [`Platform::configure_irq`].
    ConfigureIrq {
        /// Line number.
        line: u32,
        /// Trigger mode.
        trigger: TriggerFlags,
    },
    /// [`Platform::release_irq`].
    ReleaseIrq {
        /// Line number.
        line: u32,
    },
    /// [`Platform::gpio_request`].
    GpioRequest {
        /// Line number.
        line: u32,
    },
    /// [`Platform::gpio_free`].
    GpioFree {
        /// Line number.
        line: u32,
    },
    /// [`Platform::clock_enable`].
    ClockEnable(String),
    /// [`Platform::clock_disable`].
    ClockDisable(String),
    /// [`Platform::clock_set_rate`].
    ClockSetRate(String, u64),
    /// [`Platform::regulator_enable`].
    RegulatorEnable(String),
    /// [`Platform::regulator_disable`].
    RegulatorDisable(String),
    /// [`Platform::regulator_set_voltage`].
    RegulatorSetVoltage(String, u32),
}

/// Backing store of a simulated register window. Little-endian.
#[derive(Debug)]
pub struct SimRegisters {
    bytes: Mutex<Vec<u8>>,
}

impl SimRegisters {
    fn new(length: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; length]),
        }
    }

    /// Returns a copy of the window contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Overwrites a 32-bit register from the device side.
    pub fn poke32(&self, offset: usize, value: u32) {
        let mut bytes = self.bytes.lock();
        if let Some(slot) = bytes.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
impl RegisterIo for SimRegisters {
    fn read(&self, offset: u64, width: Width) -> u64 {
        let bytes = self.bytes.lock();
        let start = offset as usize;
        let n = width.bytes() as usize;
        let mut buf = [0u8; 8];
        if let Some(src) = bytes.get(start..start + n) {
            buf[..n].copy_from_slice(src);
        }
        u64::from_le_bytes(buf)
    }

    fn write(&self, offset: u64, width: Width, value: u64) {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let n = width.bytes() as usize;
        if let Some(dst) = bytes.get_mut(start..start + n) {
            dst.copy_from_slice(&value.to_le_bytes()[..n]);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SimSupply {
    enable_count: u32,
    /// Rate (Hz) for clocks, voltage (µV) for regulators.
    setting: u64,
}

#[derive(Debug, Default)]
struct SimState {
    mmio: BTreeMap<u64, Arc<SimRegisters>>,
    irq_config: BTreeMap<u32, TriggerFlags>,
    gpio_requested: BTreeMap<u32, GpioDirection>,
    gpio_levels: BTreeMap<u32, bool>,
    clocks: BTreeMap<String, SimSupply>,
    regulators: BTreeMap<String, SimSupply>,
    calls: Vec<PlatformCall>,
}

/// A software model of a board.
#[derive(Debug)]
pub struct SimPlatform {
    irq_lines: u32,
    gpio_lines: u32,
    mmio_limit: u64,
    state: Mutex<SimState>,
}

/// Builder for [`SimPlatform`].
#[derive(Debug)]
pub struct SimPlatformBuilder {
    irq_lines: u32,
    gpio_lines: u32,
    mmio_limit: u64,
    clocks: BTreeMap<String, SimSupply>,
    regulators: BTreeMap<String, SimSupply>,
}

impl SimPlatformBuilder {
    /// Number of interrupt lines on the controller.
    #[must_use]
    pub fn irq_lines(mut self, n: u32) -> Self {
        self.irq_lines = n;
        self
    }

    /// Number of GPIO lines on the controller.
    #[must_use]
    pub fn gpio_lines(mut self, n: u32) -> Self {
        self.gpio_lines = n;
        self
    }

    /// Highest bus address (exclusive) that can be mapped as registers.
    #[must_use]
    pub fn mmio_limit(mut self, limit: u64) -> Self {
        self.mmio_limit = limit;
        self
    }

    /// Adds a clock running at `rate` Hz.
    #[must_use]
    pub fn clock(mut self, name: &str, rate: u64) -> Self {
        self.clocks.insert(
            name.to_owned(),
            SimSupply {
                enable_count: 0,
                setting: rate,
            },
        );
        self
    }

    /// Adds a regulator at `microvolt`.
    #[must_use]
    pub fn regulator(mut self, name: &str, microvolt: u32) -> Self {
        self.regulators.insert(
            name.to_owned(),
            SimSupply {
                enable_count: 0,
                setting: u64::from(microvolt),
            },
        );
        self
    }

    /// Finishes the platform.
    #[must_use]
    pub fn build(self) -> SimPlatform {
        SimPlatform {
            irq_lines: self.irq_lines,
            gpio_lines: self.gpio_lines,
            mmio_limit: self.mmio_limit,
            state: Mutex::new(SimState {
                clocks: self.clocks,
                regulators: self.regulators,
                ..SimState::default()
            }),
        }
    }
}

impl SimPlatform {
    /// Starts a builder with 64 interrupt lines, 32 GPIO lines and no
    /// clocks or regulators.
    #[must_use]
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder {
            irq_lines: 64,
            gpio_lines: 32,
            mmio_limit: 0x1_0000_0000,
            clocks: BTreeMap::new(),
            regulators: BTreeMap::new(),
        }
    }

    /// Returns every primitive call so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().calls.clone()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Returns the register store mapped at `base`, if any.
    #[must_use]
    pub fn registers(&self, base: u64) -> Option<Arc<SimRegisters>> {
        self.state.lock().mmio.get(&base).cloned()
    }

    /// Number of currently mapped windows.
    #[must_use]
    pub fn mapped_windows(&self) -> usize {
        self.state.lock().mmio.len()
    }

    /// Number of currently requested GPIO lines.
    #[must_use]
    pub fn requested_gpios(&self) -> usize {
        self.state.lock().gpio_requested.len()
    }

    /// Trigger mode currently programmed on `line`.
    #[must_use]
    pub fn irq_trigger(&self, line: u32) -> Option<TriggerFlags> {
        self.state.lock().irq_config.get(&line).copied()
    }

    /// `true` if the clock has at least one enable outstanding.
    #[must_use]
    pub fn clock_enabled(&self, name: &str) -> bool {
        self.state
            .lock()
            .clocks
            .get(name)
            .is_some_and(|c| c.enable_count > 0)
    }

    /// Current rate of a clock.
    #[must_use]
    pub fn clock_rate(&self, name: &str) -> Option<u64> {
        self.state.lock().clocks.get(name).map(|c| c.setting)
    }

    /// `true` if the regulator has at least one enable outstanding.
    #[must_use]
    pub fn regulator_enabled(&self, name: &str) -> bool {
        self.state
            .lock()
            .regulators
            .get(name)
            .is_some_and(|r| r.enable_count > 0)
    }

    /// Drives an input line from outside the device.
    pub fn set_input_level(&self, line: u32, high: bool) {
        self.state.lock().gpio_levels.insert(line, high);
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Platform for SimPlatform {
    fn map_mmio(&self, base: u64, length: u64) -> Result<Arc<dyn RegisterIo>, PlatformError> {
        if length == 0 {
            return Err(PlatformError::InvalidArgument("zero-length register window"));
        }
        let end = base
            .checked_add(length)
            .ok_or(PlatformError::InvalidArgument("register window wraps"))?;
        if end > self.mmio_limit {
            return Err(PlatformError::InvalidArgument("register window beyond bus limit"));
        }
        let len = usize::try_from(length)
            .map_err(|_| PlatformError::InvalidArgument("register window too large"))?;
        let mut state = self.state.lock();
        state.calls.push(PlatformCall::MapMmio { base, length });
        let regs = state
            .mmio
            .entry(base)
            .or_insert_with(|| Arc::new(SimRegisters::new(len)))
            .clone();
        Ok(regs)
    }

    fn unmap_mmio(&self, base: u64, _length: u64) {
        let mut state = self.state.lock();
        state.calls.push(PlatformCall::UnmapMmio { base });
        state.mmio.remove(&base);
    }

    fn configure_irq(&self, line: u32, trigger: TriggerFlags) -> Result<(), PlatformError> {
        if line >= self.irq_lines {
            return Err(PlatformError::InvalidLine(line));
        }
        if trigger.contains(TriggerFlags::LEVEL_HIGH | TriggerFlags::LEVEL_LOW)
            || (trigger.is_level() && trigger.intersects(TriggerFlags::EDGE_BOTH))
        {
            return Err(PlatformError::Unsupported);
        }
        let mut state = self.state.lock();
        state.calls.push(PlatformCall::ConfigureIrq { line, trigger });
        state.irq_config.insert(line, trigger);
        Ok(())
    }

    fn release_irq(&self, line: u32) {
        let mut state = self.state.lock();
        state.calls.push(PlatformCall::ReleaseIrq { line });
        state.irq_config.remove(&line);
    }

    fn gpio_request(&self, line: u32, direction: GpioDirection) -> Result<(), PlatformError> {
        if line >= self.gpio_lines {
            return Err(PlatformError::InvalidLine(line));
        }
        let mut state = self.state.lock();
        state.calls.push(PlatformCall::GpioRequest { line });
        state.gpio_requested.insert(line, direction);
        Ok(())
    }

    fn gpio_free(&self, line: u32) {
        let mut state = self.state.lock();
        state.calls.push(PlatformCall::GpioFree { line });
        state.gpio_requested.remove(&line);
    }

    fn gpio_set(&self, line: u32, high: bool) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        match state.gpio_requested.get(&line) {
            Some(GpioDirection::Output) => {
                state.gpio_levels.insert(line, high);
                Ok(())
            }
            Some(GpioDirection::Input) => Err(PlatformError::Unsupported),
            None => Err(PlatformError::InvalidLine(line)),
        }
    }

    fn gpio_get(&self, line: u32) -> Result<bool, PlatformError> {
        if line >= self.gpio_lines {
            return Err(PlatformError::InvalidLine(line));
        }
        Ok(self
            .state
            .lock()
            .gpio_levels
            .get(&line)
            .copied()
            .unwrap_or(false))
    }

    fn clock_enable(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let clock = state.clocks.get_mut(name).ok_or(PlatformError::NotFound)?;
        clock.enable_count += 1;
        state.calls.push(PlatformCall::ClockEnable(name.to_owned()));
        Ok(())
    }

    fn clock_disable(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(clock) = state.clocks.get_mut(name) {
            clock.enable_count = clock.enable_count.saturating_sub(1);
        }
        state.calls.push(PlatformCall::ClockDisable(name.to_owned()));
    }

    fn clock_set_rate(&self, name: &str, rate: u64) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let clock = state.clocks.get_mut(name).ok_or(PlatformError::NotFound)?;
        clock.setting = rate;
        state
            .calls
            .push(PlatformCall::ClockSetRate(name.to_owned(), rate));
        Ok(())
    }

    fn regulator_enable(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let reg = state
            .regulators
            .get_mut(name)
            .ok_or(PlatformError::NotFound)?;
        reg.enable_count += 1;
        state
            .calls
            .push(PlatformCall::RegulatorEnable(name.to_owned()));
        Ok(())
    }

    fn regulator_disable(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(reg) = state.regulators.get_mut(name) {
            reg.enable_count = reg.enable_count.saturating_sub(1);
        }
        state
            .calls
            .push(PlatformCall::RegulatorDisable(name.to_owned()));
    }

    fn regulator_set_voltage(&self, name: &str, microvolt: u32) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let reg = state
            .regulators
            .get_mut(name)
            .ok_or(PlatformError::NotFound)?;
        reg.setting = u64::from(microvolt);
        state
            .calls
            .push(PlatformCall::RegulatorSetVoltage(name.to_owned(), microvolt));
        Ok(())
    }
}
