//! Resource specifications decoded from a hardware node.
//!
//! A [`ResourceSpec`] says *what* a device needs, not whether it can have
//! it. [`decode_specs`] reads the standard properties of a node:
//!
//! | property | spec |
//! |---|---|
//! | `reg` | one [`ResourceSpec::MemoryWindow`] per entry |
//! | `interrupts` | one [`ResourceSpec::InterruptLine`] per specifier |
//! | `gpios`, `<name>-gpios` | one [`ResourceSpec::GpioLine`] per specifier |
//! | `clock-names` / `clocks` | one [`ResourceSpec::ClockRequest`] per clock |
//! | `<name>-supply` | one [`ResourceSpec::RegulatorRequest`] |

use core::fmt;

use bitflags::bitflags;
use platdev_devtree::{DeviceTree, DirectoryError, NodeRef};

bitflags! {
    /// Interrupt trigger mode, encoded as in the devicetree `IRQ_TYPE_*`
    /// constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TriggerFlags: u32 {
        /// Rising edge.
        const EDGE_RISING = 1 << 0;
        /// Falling edge.
        const EDGE_FALLING = 1 << 1;
        /// Both edges.
        const EDGE_BOTH = Self::EDGE_RISING.bits() | Self::EDGE_FALLING.bits();
        /// Active-high level.
        const LEVEL_HIGH = 1 << 2;
        /// Active-low level.
        const LEVEL_LOW = 1 << 3;
    }
}

impl TriggerFlags {
    /// Returns `true` for level-triggered modes.
    #[must_use]
    pub fn is_level(self) -> bool {
        self.intersects(Self::LEVEL_HIGH | Self::LEVEL_LOW)
    }
}

bitflags! {
    /// GPIO specifier flags, encoded as in the devicetree `GPIO_*` constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GpioFlags: u32 {
        /// Line is active low.
        const ACTIVE_LOW = 1 << 0;
        /// Single-ended (open drain / open source) output.
        const SINGLE_ENDED = 1 << 1;
        /// Enable the internal pull-up.
        const PULL_UP = 1 << 4;
        /// Enable the internal pull-down.
        const PULL_DOWN = 1 << 5;
    }
}

/// Direction a GPIO line is requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioDirection {
    /// The device reads the line.
    Input,
    /// The device drives the line.
    Output,
}

/// A hardware resource a device needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    /// A memory-mapped register window.
    MemoryWindow {
        /// Bus address.
        base: u64,
        /// Length in bytes.
        length: u64,
    },
    /// An interrupt line.
    InterruptLine {
        /// Controller line number.
        line: u32,
        /// Trigger mode; empty means "leave as configured".
        trigger: TriggerFlags,
    },
    /// A GPIO line.
    GpioLine {
        /// Controller line number.
        line: u32,
        /// Requested direction.
        direction: GpioDirection,
        /// Specifier flags.
        flags: GpioFlags,
    },
    /// A named clock, optionally at a fixed rate.
    ClockRequest {
        /// Clock name.
        name: String,
        /// Rate in Hz to program after enabling.
        rate: Option<u64>,
    },
    /// A named regulator, optionally at a fixed voltage.
    RegulatorRequest {
        /// Regulator name.
        name: String,
        /// Voltage in microvolts to program before enabling.
        microvolt: Option<u32>,
    },
}

/// Acquisition class. Specs are acquired in ascending class order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceClass {
    /// Register windows.
    Memory,
    /// Interrupt lines.
    Interrupt,
    /// GPIO lines.
    Gpio,
    /// Clocks and regulators.
    Power,
}

impl ResourceSpec {
    /// Returns the acquisition class of this spec.
    #[must_use]
    pub fn class(&self) -> ResourceClass {
        match self {
            Self::MemoryWindow { .. } => ResourceClass::Memory,
            Self::InterruptLine { .. } => ResourceClass::Interrupt,
            Self::GpioLine { .. } => ResourceClass::Gpio,
            Self::ClockRequest { .. } | Self::RegulatorRequest { .. } => ResourceClass::Power,
        }
    }

    /// Returns `true` if failing to acquire this resource must fail the
    /// probe. Clocks and regulators are optional.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.class() != ResourceClass::Power
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryWindow { base, length } => {
                write!(f, "memory window {base:#x}+{length:#x}")
            }
            Self::InterruptLine { line, .. } => write!(f, "interrupt line {line}"),
            Self::GpioLine { line, .. } => write!(f, "gpio {line}"),
            Self::ClockRequest { name, .. } => write!(f, "clock '{name}'"),
            Self::RegulatorRequest { name, .. } => write!(f, "regulator '{name}'"),
        }
    }
}

/// Decodes every resource spec of `node`, in acquisition order.
///
/// # Errors
///
/// Propagates [`DirectoryError`]s from malformed or mistyped properties.
pub fn decode_specs(tree: &DeviceTree, node: &NodeRef<'_>) -> Result<Vec<ResourceSpec>, DirectoryError> {
    let mut specs = Vec::new();

    for entry in node.reg()? {
        specs.push(ResourceSpec::MemoryWindow {
            base: entry.base,
            length: entry.size,
        });
    }

    for spec in node.interrupts()? {
        let (line, flags) = match spec.as_slice() {
            [line] => (*line, 0),
            [line, flags] => (*line, *flags),
            [_, line, flags, ..] => (*line, *flags),
            [] => continue,
        };
        specs.push(ResourceSpec::InterruptLine {
            line,
            trigger: TriggerFlags::from_bits_truncate(flags),
        });
    }

    decode_gpios(tree, node, &mut specs)?;
    decode_clocks(node, &mut specs)?;
    decode_supplies(tree, node, &mut specs)?;

    specs.sort_by_key(ResourceSpec::class);
    Ok(specs)
}

fn decode_gpios(
    tree: &DeviceTree,
    node: &NodeRef<'_>,
    specs: &mut Vec<ResourceSpec>,
) -> Result<(), DirectoryError> {
    let hw = node.node();
    let names: Vec<String> = hw
        .properties()
        .map(|(name, _)| name)
        .filter(|name| *name == "gpios" || name.ends_with("-gpios"))
        .map(str::to_owned)
        .collect();

    for prop in names {
        let Some(cells) = hw.find_u32_array(&prop)? else {
            continue;
        };
        let direction = infer_direction(&prop);
        let mut rest = cells.as_slice();
        while let [phandle, tail @ ..] = rest {
            // `#gpio-cells` of the controller; two (line, flags) unless stated.
            let width = tree
                .by_phandle(*phandle)
                .and_then(|c| c.node().find_u32("#gpio-cells").ok().flatten())
                .unwrap_or(2) as usize;
            if width == 0 || tail.len() < width {
                return Err(DirectoryError::MalformedProperty {
                    node: hw.name().to_owned(),
                    property: prop,
                });
            }
            let flags = if width >= 2 { tail[1] } else { 0 };
            specs.push(ResourceSpec::GpioLine {
                line: tail[0],
                direction,
                flags: GpioFlags::from_bits_truncate(flags),
            });
            rest = &tail[width..];
        }
    }
    Ok(())
}

/// Picks a direction from the consumer property name. Lines that report
/// something to the device (card detect, write protect, interrupts) are
/// inputs; everything else the device drives.
fn infer_direction(prop: &str) -> GpioDirection {
    let stem = prop.trim_end_matches("gpios").trim_end_matches('-');
    let inputs = ["", "cd", "wp", "detect", "irq", "int", "interrupt", "sense", "button"];
    if inputs.iter().any(|i| stem == *i || stem.ends_with(&format!("-{i}"))) {
        GpioDirection::Input
    } else {
        GpioDirection::Output
    }
}

fn decode_clocks(node: &NodeRef<'_>, specs: &mut Vec<ResourceSpec>) -> Result<(), DirectoryError> {
    let hw = node.node();
    let rates = hw.find_u32_array("assigned-clock-rates")?.unwrap_or_default();
    let names: Vec<String> = match hw.find_str_list("clock-names")? {
        Some(list) => list.into_iter().map(str::to_owned).collect(),
        // Unnamed clocks: one per phandle-with-one-cell pair.
        None => match hw.find_u32_array("clocks")? {
            Some(cells) => (0..cells.len() / 2).map(|i| format!("clk{i}")).collect(),
            None => Vec::new(),
        },
    };
    for (i, name) in names.into_iter().enumerate() {
        let rate = rates.get(i).copied().filter(|r| *r != 0).map(u64::from);
        specs.push(ResourceSpec::ClockRequest { name, rate });
    }
    Ok(())
}

fn decode_supplies(
    tree: &DeviceTree,
    node: &NodeRef<'_>,
    specs: &mut Vec<ResourceSpec>,
) -> Result<(), DirectoryError> {
    let hw = node.node();
    let supplies: Vec<String> = hw
        .properties()
        .filter_map(|(name, _)| name.strip_suffix("-supply"))
        .map(str::to_owned)
        .collect();

    for supply in supplies {
        let handle = hw.find_u32(&format!("{supply}-supply"))?;
        let name = handle
            .and_then(|h| tree.by_phandle(h))
            .and_then(|reg| {
                reg.node()
                    .find_str("regulator-name")
                    .ok()
                    .flatten()
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| supply.clone());
        let microvolt = hw.find_u32(&format!("{supply}-microvolt"))?;
        specs.push(ResourceSpec::RegulatorRequest { name, microvolt });
    }
    Ok(())
}
