//! `platdev-devtree` --- the hardware description tree.
//!
//! The board-setup side hands the core a serialized Flattened Device Tree
//! (DTB). This crate parses it once into an owned, immutable tree of
//! [`HardwareNode`]s whose properties are decoded into [`TypedValue`]s, and
//! answers the questions the rest of the core asks of it:
//!
//! - typed property lookup that never coerces between kinds,
//! - path lookup and depth-first walks that carry the parent's addressing
//!   context (`#address-cells`, `#size-cells`, interrupt cells),
//! - matching a node's `compatible` list against a [`DriverTable`].
//!
//! # Usage
//!
//! ```ignore
//! let tree = DeviceTree::parse(dtb_bytes)?;
//! let uart = tree.find("/soc/uart@10000000").unwrap();
//! let regs = uart.reg()?;
//! let driver = table.match_node(uart.node())?;
//! ```

pub mod fdt;
pub mod matching;
pub mod node;
pub mod tree;
pub mod value;

pub use fdt::{FdtError, MemReservation};
pub use matching::{DriverMatch, DriverTable};
pub use node::{HardwareNode, NodeBuilder};
pub use tree::{DeviceTree, NodeRef, RegEntry};
pub use value::{TypedValue, ValueType};

use core::fmt;

/// Errors reported by the resource directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The serialized tree could not be parsed.
    Fdt(FdtError),
    /// No registered driver supports any of the node's compatible strings.
    NoMatchingDriver {
        /// Name of the node that failed to match.
        node: String,
    },
    /// A property the operation cannot do without is absent.
    MissingRequiredProperty {
        /// Name of the node.
        node: String,
        /// Name of the missing property.
        property: String,
    },
    /// A property exists but holds a different kind of value than requested.
    PropertyTypeMismatch {
        /// Name of the node.
        node: String,
        /// Name of the property.
        property: String,
        /// The kind the caller asked for.
        expected: ValueType,
        /// The kind the property actually holds.
        found: ValueType,
    },
    /// A property has the right kind but malformed contents (e.g. a `reg`
    /// whose length is not a multiple of the entry size).
    MalformedProperty {
        /// Name of the node.
        node: String,
        /// Name of the property.
        property: String,
    },
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fdt(err) => write!(f, "invalid device tree blob: {err}"),
            Self::NoMatchingDriver { node } => write!(f, "no matching driver for {node}"),
            Self::MissingRequiredProperty { node, property } => {
                write!(f, "{node}: missing required property '{property}'")
            }
            Self::PropertyTypeMismatch {
                node,
                property,
                expected,
                found,
            } => write!(
                f,
                "{node}: property '{property}' is {found}, expected {expected}"
            ),
            Self::MalformedProperty { node, property } => {
                write!(f, "{node}: property '{property}' is malformed")
            }
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<FdtError> for DirectoryError {
    fn from(err: FdtError) -> Self {
        Self::Fdt(err)
    }
}
