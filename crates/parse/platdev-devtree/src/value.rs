//! Typed property values and their DTB encoding.
//!
//! DTB properties are untyped byte strings. Decoding uses a table of
//! well-known property names first and falls back to the same heuristics
//! `dtc` applies when decompiling:
//!
//! - empty ⇒ boolean,
//! - NUL-terminated printable text ⇒ string, or string list if it holds
//!   several NUL-separated entries,
//! - exactly 4 bytes ⇒ integer,
//! - any other multiple of 4 ⇒ integer (cell) array,
//! - anything else ⇒ raw bytes.

use core::fmt;

/// A decoded property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedValue {
    /// A single 32- or 64-bit integer.
    Integer(u64),
    /// A single string.
    String(String),
    /// An ordered list of strings.
    StringList(Vec<String>),
    /// A presence-only flag. `false` is never stored in a parsed tree.
    Boolean(bool),
    /// A sequence of 32-bit cells.
    IntegerArray(Vec<u32>),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

/// Kind of a [`TypedValue`], used in type-mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// [`TypedValue::Integer`].
    Integer,
    /// [`TypedValue::String`].
    String,
    /// [`TypedValue::StringList`].
    StringList,
    /// [`TypedValue::Boolean`].
    Boolean,
    /// [`TypedValue::IntegerArray`].
    IntegerArray,
    /// [`TypedValue::Bytes`].
    Bytes,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integer => "integer",
            Self::String => "string",
            Self::StringList => "string list",
            Self::Boolean => "boolean",
            Self::IntegerArray => "integer array",
            Self::Bytes => "byte array",
        })
    }
}

/// How a well-known property is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schema {
    Integer,
    String,
    StringList,
    Cells,
    Flag,
}

/// Returns the encoding of a well-known property, if `name` is one.
fn schema_for(name: &str) -> Option<Schema> {
    let schema = match name {
        "#address-cells" | "#size-cells" | "#interrupt-cells" | "#gpio-cells"
        | "#clock-cells" | "#dma-cells" | "phandle" | "linux,phandle" | "interrupt-parent"
        | "clock-frequency" | "reg-shift" | "reg-io-width" | "current-speed" => Schema::Integer,
        "status" | "model" | "device_type" | "label" | "bootargs" | "stdout-path" => {
            Schema::String
        }
        "compatible" | "clock-names" | "reg-names" | "interrupt-names" | "dma-names"
        | "pinctrl-names" | "clock-output-names" | "gpio-line-names" => Schema::StringList,
        "reg" | "interrupts" | "interrupts-extended" | "ranges" | "dma-ranges" | "clocks"
        | "assigned-clocks" | "assigned-clock-rates" | "gpios" | "dmas" => Schema::Cells,
        "interrupt-controller" | "gpio-controller" | "dma-coherent" | "wakeup-source" => {
            Schema::Flag
        }
        _ if name.ends_with("-gpios") || name.ends_with("-gpio") => Schema::Cells,
        _ if name.ends_with("-supply") => Schema::Integer,
        _ if name.ends_with("-microvolt") => Schema::Integer,
        _ => return None,
    };
    Some(schema)
}

impl TypedValue {
    /// Returns the kind of this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Integer(_) => ValueType::Integer,
            Self::String(_) => ValueType::String,
            Self::StringList(_) => ValueType::StringList,
            Self::Boolean(_) => ValueType::Boolean,
            Self::IntegerArray(_) => ValueType::IntegerArray,
            Self::Bytes(_) => ValueType::Bytes,
        }
    }

    /// Decodes the raw bytes of property `name`.
    #[must_use]
    pub fn decode(name: &str, data: &[u8]) -> Self {
        if data.is_empty() {
            return match schema_for(name) {
                Some(Schema::String) => Self::String(String::new()),
                Some(Schema::StringList) => Self::StringList(Vec::new()),
                Some(Schema::Cells) if name != "ranges" && name != "dma-ranges" => {
                    Self::IntegerArray(Vec::new())
                }
                _ => Self::Boolean(true),
            };
        }

        match schema_for(name) {
            Some(Schema::Integer) => match data.len() {
                4 => Self::Integer(u64::from(be32(data, 0))),
                8 => Self::Integer(be64(data)),
                _ => Self::decode_cells(data),
            },
            Some(Schema::String) => match split_strings(data) {
                Some(mut list) if list.len() == 1 => Self::String(list.remove(0)),
                Some(list) => Self::StringList(list),
                None => Self::Bytes(data.to_vec()),
            },
            Some(Schema::StringList) => match split_strings(data) {
                Some(list) => Self::StringList(list),
                None => Self::Bytes(data.to_vec()),
            },
            Some(Schema::Cells) => Self::decode_cells(data),
            // A flag with a payload is not a flag.
            Some(Schema::Flag) | None => Self::infer(data),
        }
    }

    fn infer(data: &[u8]) -> Self {
        if is_printable_strings(data) {
            if let Some(mut list) = split_strings(data) {
                return if list.len() == 1 {
                    Self::String(list.remove(0))
                } else {
                    Self::StringList(list)
                };
            }
        }
        if data.len() == 4 {
            return Self::Integer(u64::from(be32(data, 0)));
        }
        Self::decode_cells(data)
    }

    fn decode_cells(data: &[u8]) -> Self {
        if data.len() % 4 != 0 {
            return Self::Bytes(data.to_vec());
        }
        Self::IntegerArray((0..data.len() / 4).map(|i| be32(data, i * 4)).collect())
    }

    /// Encodes the value as DTB property bytes.
    ///
    /// Returns `None` for `Boolean(false)`, which is represented by omitting
    /// the property.
    #[must_use]
    pub fn encode(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            Self::Integer(v) => match u32::try_from(*v) {
                Ok(small) => small.to_be_bytes().to_vec(),
                Err(_) => v.to_be_bytes().to_vec(),
            },
            Self::String(s) => {
                let mut out = Vec::with_capacity(s.len() + 1);
                out.extend_from_slice(s.as_bytes());
                out.push(0);
                out
            }
            Self::StringList(list) => {
                let mut out = Vec::new();
                for s in list {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                out
            }
            Self::Boolean(true) => Vec::new(),
            Self::Boolean(false) => return None,
            Self::IntegerArray(cells) => cells.iter().flat_map(|c| c.to_be_bytes()).collect(),
            Self::Bytes(b) => b.clone(),
        };
        Some(bytes)
    }
}

impl From<u32> for TypedValue {
    fn from(v: u32) -> Self {
        Self::Integer(u64::from(v))
    }
}

impl From<u64> for TypedValue {
    fn from(v: u64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<bool> for TypedValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<u32>> for TypedValue {
    fn from(cells: Vec<u32>) -> Self {
        Self::IntegerArray(cells)
    }
}

impl<const N: usize> From<[u32; N]> for TypedValue {
    fn from(cells: [u32; N]) -> Self {
        Self::IntegerArray(cells.to_vec())
    }
}

impl<const N: usize> From<[&str; N]> for TypedValue {
    fn from(list: [&str; N]) -> Self {
        Self::StringList(list.iter().map(|s| (*s).to_owned()).collect())
    }
}

// ---- Byte helpers -----------------------------------------------------------

fn be32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

fn be64(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    u64::from_be_bytes(buf)
}

/// Splits a NUL-terminated, NUL-separated list into UTF-8 strings.
fn split_strings(data: &[u8]) -> Option<Vec<String>> {
    let body = data.strip_suffix(&[0])?;
    body.split(|&b| b == 0)
        .map(|s| core::str::from_utf8(s).ok().map(str::to_owned))
        .collect()
}

/// `true` if `data` looks like one or more printable, NUL-terminated strings.
fn is_printable_strings(data: &[u8]) -> bool {
    let Some(body) = data.strip_suffix(&[0]) else {
        return false;
    };
    !body.is_empty()
        && body
            .split(|&b| b == 0)
            .all(|s| !s.is_empty() && s.iter().all(|&b| (0x20..0x7f).contains(&b)))
}
