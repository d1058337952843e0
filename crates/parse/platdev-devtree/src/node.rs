//! Hardware nodes and typed property lookup.

use std::collections::BTreeMap;

use crate::DirectoryError;
use crate::value::{TypedValue, ValueType};

/// A node of the hardware description tree.
///
/// Immutable once built. The `compatible` list is cached in priority order
/// (most specific first) because matching reads it for every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareNode {
    name: String,
    compatible: Vec<String>,
    properties: BTreeMap<String, TypedValue>,
    children: Vec<HardwareNode>,
}

impl HardwareNode {
    /// Starts building a node called `name` (e.g. `"uart@10000000"`).
    #[must_use]
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder {
            name: name.into(),
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Returns the node name including the unit address.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the part of the name before `@`.
    #[must_use]
    pub fn base_name(&self) -> &str {
        self.name.split('@').next().unwrap_or("")
    }

    /// Parses the unit address (the hex digits after `@`, up to the first
    /// comma).
    #[must_use]
    pub fn unit_address(&self) -> Option<u64> {
        let (_, unit) = self.name.split_once('@')?;
        let first = unit.split(',').next()?;
        u64::from_str_radix(first, 16).ok()
    }

    /// Returns the compatible identifiers in priority order.
    #[must_use]
    pub fn compatible(&self) -> &[String] {
        &self.compatible
    }

    /// Returns `true` unless the node carries `status = "disabled"` (or any
    /// value other than `"okay"`/`"ok"`).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        match self.properties.get("status") {
            Some(TypedValue::String(s)) => s == "okay" || s == "ok",
            _ => true,
        }
    }

    /// Returns the direct children in tree order.
    #[must_use]
    pub fn children(&self) -> &[HardwareNode] {
        &self.children
    }

    /// Finds a direct child by full name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&HardwareNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns an iterator over `(name, value)` pairs in name order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &TypedValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns `true` if a property named `property` exists.
    #[must_use]
    pub fn has(&self, property: &str) -> bool {
        self.properties.contains_key(property)
    }

    /// Looks up a property without interpreting it.
    #[must_use]
    pub fn find(&self, property: &str) -> Option<&TypedValue> {
        self.properties.get(property)
    }

    fn mismatch(&self, property: &str, expected: ValueType, found: &TypedValue) -> DirectoryError {
        DirectoryError::PropertyTypeMismatch {
            node: self.name.clone(),
            property: property.to_owned(),
            expected,
            found: found.value_type(),
        }
    }

    /// Looks up a 32-bit integer property.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] if the property is not
    /// an integer or does not fit in 32 bits.
    pub fn find_u32(&self, property: &str) -> Result<Option<u32>, DirectoryError> {
        match self.find(property) {
            None => Ok(None),
            Some(v @ TypedValue::Integer(n)) => u32::try_from(*n)
                .map(Some)
                .map_err(|_| self.mismatch(property, ValueType::Integer, v)),
            Some(other) => Err(self.mismatch(property, ValueType::Integer, other)),
        }
    }

    /// Looks up an integer property of either width.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] if the property is not
    /// an integer.
    pub fn find_u64(&self, property: &str) -> Result<Option<u64>, DirectoryError> {
        match self.find(property) {
            None => Ok(None),
            Some(TypedValue::Integer(n)) => Ok(Some(*n)),
            Some(other) => Err(self.mismatch(property, ValueType::Integer, other)),
        }
    }

    /// Looks up a string property.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] if the property is not
    /// a single string.
    pub fn find_str(&self, property: &str) -> Result<Option<&str>, DirectoryError> {
        match self.find(property) {
            None => Ok(None),
            Some(TypedValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.mismatch(property, ValueType::String, other)),
        }
    }

    /// Looks up a string list. A single string is a one-element list.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] for non-string
    /// properties.
    pub fn find_str_list(&self, property: &str) -> Result<Option<Vec<&str>>, DirectoryError> {
        match self.find(property) {
            None => Ok(None),
            Some(TypedValue::String(s)) => Ok(Some(vec![s.as_str()])),
            Some(TypedValue::StringList(list)) => {
                Ok(Some(list.iter().map(String::as_str).collect()))
            }
            Some(other) => Err(self.mismatch(property, ValueType::StringList, other)),
        }
    }

    /// Looks up a boolean flag. Absent means `false`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] if the property
    /// carries a payload.
    pub fn find_bool(&self, property: &str) -> Result<bool, DirectoryError> {
        match self.find(property) {
            None => Ok(false),
            Some(TypedValue::Boolean(b)) => Ok(*b),
            Some(other) => Err(self.mismatch(property, ValueType::Boolean, other)),
        }
    }

    /// Looks up a cell array. A 32-bit integer is a one-cell array.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] for non-integer
    /// properties.
    pub fn find_u32_array(&self, property: &str) -> Result<Option<Vec<u32>>, DirectoryError> {
        match self.find(property) {
            None => Ok(None),
            Some(TypedValue::IntegerArray(cells)) => Ok(Some(cells.clone())),
            Some(v @ TypedValue::Integer(n)) => u32::try_from(*n)
                .map(|c| Some(vec![c]))
                .map_err(|_| self.mismatch(property, ValueType::IntegerArray, v)),
            Some(other) => Err(self.mismatch(property, ValueType::IntegerArray, other)),
        }
    }

    /// Looks up an opaque byte property.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] if the property
    /// decoded to anything other than raw bytes.
    pub fn find_bytes(&self, property: &str) -> Result<Option<&[u8]>, DirectoryError> {
        match self.find(property) {
            None => Ok(None),
            Some(TypedValue::Bytes(b)) => Ok(Some(b)),
            Some(other) => Err(self.mismatch(property, ValueType::Bytes, other)),
        }
    }

    /// Like [`find_u32`](Self::find_u32) but absence is an error.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::MissingRequiredProperty`] if absent.
    pub fn require_u32(&self, property: &str) -> Result<u32, DirectoryError> {
        self.find_u32(property)?
            .ok_or_else(|| DirectoryError::MissingRequiredProperty {
                node: self.name.clone(),
                property: property.to_owned(),
            })
    }
}

/// Builder for [`HardwareNode`].
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    name: String,
    properties: BTreeMap<String, TypedValue>,
    children: Vec<HardwareNode>,
}

impl NodeBuilder {
    /// Sets the `compatible` list, most specific first.
    #[must_use]
    pub fn compatible<I, S>(self, list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = list.into_iter().map(Into::into).collect();
        self.property("compatible", TypedValue::StringList(list))
    }

    /// Sets an arbitrary property, replacing any earlier value.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Sets a presence-only flag.
    #[must_use]
    pub fn flag(self, name: impl Into<String>) -> Self {
        self.property(name, TypedValue::Boolean(true))
    }

    /// Appends a child node.
    #[must_use]
    pub fn child(mut self, child: HardwareNode) -> Self {
        self.children.push(child);
        self
    }

    pub(crate) fn push_property(&mut self, name: String, value: TypedValue) {
        self.properties.insert(name, value);
    }

    pub(crate) fn push_child(&mut self, child: HardwareNode) {
        self.children.push(child);
    }

    /// Finishes the node.
    #[must_use]
    pub fn build(self) -> HardwareNode {
        let compatible = match self.properties.get("compatible") {
            Some(TypedValue::StringList(list)) => list.clone(),
            Some(TypedValue::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };
        HardwareNode {
            name: self.name,
            compatible,
            properties: self.properties,
            children: self.children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uart() -> HardwareNode {
        HardwareNode::builder("uart@10000000")
            .compatible(["vendor,uart-v2", "generic,uart"])
            .property("reg", [0x1000_0000u32, 0x100])
            .property("clock-frequency", 1_843_200u32)
            .property("status", "okay")
            .flag("dma-coherent")
            .build()
    }

    #[test]
    fn name_parts() {
        let n = uart();
        assert_eq!(n.base_name(), "uart");
        assert_eq!(n.unit_address(), Some(0x1000_0000));
    }

    #[test]
    fn compatible_in_priority_order() {
        assert_eq!(uart().compatible(), &["vendor,uart-v2", "generic,uart"]);
    }

    #[test]
    fn typed_lookup() {
        let n = uart();
        assert_eq!(n.find_u32("clock-frequency").unwrap(), Some(1_843_200));
        assert_eq!(n.find_str("status").unwrap(), Some("okay"));
        assert!(n.find_bool("dma-coherent").unwrap());
        assert!(!n.find_bool("wakeup-source").unwrap());
        assert_eq!(
            n.find_u32_array("reg").unwrap(),
            Some(vec![0x1000_0000, 0x100])
        );
    }

    #[test]
    fn absent_optional_is_none() {
        let n = uart();
        assert_eq!(n.find_u32("reg-shift").unwrap(), None);
        assert_eq!(n.find_str("label").unwrap(), None);
        assert!(n.find("nothing").is_none());
    }

    #[test]
    fn integer_from_string_is_mismatch() {
        let n = uart();
        let err = n.find_u32("status").unwrap_err();
        assert_eq!(
            err,
            DirectoryError::PropertyTypeMismatch {
                node: "uart@10000000".into(),
                property: "status".into(),
                expected: ValueType::Integer,
                found: ValueType::String,
            }
        );
    }

    #[test]
    fn string_from_integer_is_mismatch() {
        assert!(matches!(
            uart().find_str("clock-frequency"),
            Err(DirectoryError::PropertyTypeMismatch { .. })
        ));
    }

    #[test]
    fn oversized_integer_is_mismatch_for_u32() {
        let n = HardwareNode::builder("x")
            .property("clock-frequency", 1u64 << 33)
            .build();
        assert!(n.find_u32("clock-frequency").is_err());
        assert_eq!(n.find_u64("clock-frequency").unwrap(), Some(1 << 33));
    }

    #[test]
    fn require_reports_missing() {
        let err = uart().require_u32("reg-shift").unwrap_err();
        assert!(matches!(err, DirectoryError::MissingRequiredProperty { .. }));
    }

    #[test]
    fn status_disabled() {
        let n = HardwareNode::builder("i2c@3000")
            .property("status", "disabled")
            .build();
        assert!(!n.is_enabled());
        assert!(uart().is_enabled());
    }

    #[test]
    fn single_string_compatible() {
        let n = HardwareNode::builder("timer")
            .property("compatible", "generic,timer")
            .build();
        assert_eq!(n.compatible(), &["generic,timer"]);
    }
}
