//! Compatible-string driver matching.
//!
//! A node lists its compatible identifiers most specific first. Matching
//! walks that list in order and, for each identifier, scans the table in
//! registration order; the first hit wins. A board that describes a UART as
//! `"vendor,uart-v2", "generic,uart"` therefore binds the vendor driver when
//! one is registered and falls back to the generic driver otherwise.

use crate::DirectoryError;
use crate::node::HardwareNode;
use crate::value::TypedValue;

/// Something that can be matched against a node's compatible list.
pub trait DriverMatch {
    /// Driver name used in diagnostics.
    fn name(&self) -> &str;

    /// Compatible identifiers this driver supports.
    fn compatible(&self) -> &[&str];
}

/// An ordered collection of matchable driver entries.
#[derive(Debug, Clone)]
pub struct DriverTable<D> {
    entries: Vec<D>,
}

impl<D> Default for DriverTable<D> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<D: DriverMatch> DriverTable<D> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Earlier entries win ties on the same identifier.
    pub fn push(&mut self, entry: D) {
        self.entries.push(entry);
    }

    /// Removes the entry called `name`, returning it.
    pub fn remove(&mut self, name: &str) -> Option<D> {
        let idx = self.entries.iter().position(|e| e.name() == name)?;
        Some(self.entries.remove(idx))
    }

    /// Looks up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&D> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.entries.iter()
    }

    /// Finds the driver for `node`.
    ///
    /// # Errors
    ///
    /// - [`DirectoryError::MissingRequiredProperty`] if the node has no
    ///   `compatible` property.
    /// - [`DirectoryError::PropertyTypeMismatch`] if `compatible` is not a
    ///   string list.
    /// - [`DirectoryError::NoMatchingDriver`] if no entry supports any of the
    ///   node's identifiers.
    pub fn match_node(&self, node: &HardwareNode) -> Result<&D, DirectoryError> {
        match node.find("compatible") {
            None => {
                return Err(DirectoryError::MissingRequiredProperty {
                    node: node.name().to_owned(),
                    property: "compatible".to_owned(),
                });
            }
            Some(TypedValue::String(_) | TypedValue::StringList(_)) => {}
            Some(_) => {
                // Surface the mismatch through the typed accessor.
                node.find_str_list("compatible")?;
            }
        }

        for compat in node.compatible() {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.compatible().contains(&compat.as_str()))
            {
                log::debug!(
                    target: "platdev::devtree",
                    "{}: matched driver '{}' via \"{compat}\"",
                    node.name(),
                    entry.name()
                );
                return Ok(entry);
            }
        }

        Err(DirectoryError::NoMatchingDriver {
            node: node.name().to_owned(),
        })
    }
}

/// Finds the driver in `table` for `node`. See [`DriverTable::match_node`].
///
/// # Errors
///
/// Same as [`DriverTable::match_node`].
pub fn match_node<'t, D: DriverMatch>(
    node: &HardwareNode,
    table: &'t DriverTable<D>,
) -> Result<&'t D, DirectoryError> {
    table.match_node(node)
}
