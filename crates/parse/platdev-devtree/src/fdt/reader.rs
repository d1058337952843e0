//! DTB reader.
//!
//! Validates the header, bounds-checks every block, then walks the structure
//! block once, decoding each property with [`TypedValue::decode`].

use super::{
    FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_HEADER_SIZE, FDT_MAGIC, FDT_MIN_COMPAT_VERSION,
    FDT_NOP, FDT_PROP, FdtError, MemReservation, align4,
};
use crate::node::HardwareNode;
use crate::value::TypedValue;

/// Deepest node nesting accepted before the blob is declared malformed.
const MAX_DEPTH: usize = 64;

/// Contents of a parsed blob.
#[derive(Debug, Clone)]
pub struct ParsedBlob {
    /// Root node.
    pub root: HardwareNode,
    /// Memory reservation entries, terminator excluded.
    pub reservations: Vec<MemReservation>,
    /// Physical id of the boot CPU.
    pub boot_cpuid: u32,
}

/// Header fields we use, in native endianness.
struct Header {
    total_size: usize,
    off_struct: usize,
    off_strings: usize,
    off_mem_rsv: usize,
    boot_cpuid: u32,
    size_strings: usize,
    size_struct: usize,
}

fn read_be32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn read_be64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(offset..offset.checked_add(8)?)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn read_header(data: &[u8]) -> Result<Header, FdtError> {
    if data.len() < FDT_HEADER_SIZE {
        return Err(FdtError::TruncatedData);
    }
    let field = |idx: usize| read_be32(data, idx * 4).ok_or(FdtError::TruncatedData);

    if field(0)? != FDT_MAGIC {
        return Err(FdtError::InvalidMagic);
    }
    if field(6)? < FDT_MIN_COMPAT_VERSION {
        return Err(FdtError::UnsupportedVersion);
    }

    Ok(Header {
        total_size: field(1)? as usize,
        off_struct: field(2)? as usize,
        off_strings: field(3)? as usize,
        off_mem_rsv: field(4)? as usize,
        boot_cpuid: field(7)?,
        size_strings: field(8)? as usize,
        size_struct: field(9)? as usize,
    })
}

/// Parses a DTB blob.
///
/// # Errors
///
/// Returns an [`FdtError`] if the blob is malformed.
pub fn parse(data: &[u8]) -> Result<ParsedBlob, FdtError> {
    let hdr = read_header(data)?;

    if data.len() < hdr.total_size {
        return Err(FdtError::TruncatedData);
    }

    let struct_end = hdr
        .off_struct
        .checked_add(hdr.size_struct)
        .ok_or(FdtError::InvalidStructure)?;
    let strings_end = hdr
        .off_strings
        .checked_add(hdr.size_strings)
        .ok_or(FdtError::InvalidStructure)?;
    if struct_end > hdr.total_size
        || strings_end > hdr.total_size
        || hdr.off_mem_rsv > hdr.total_size
    {
        return Err(FdtError::TruncatedData);
    }

    let struct_block = &data[hdr.off_struct..struct_end];
    let strings_block = &data[hdr.off_strings..strings_end];

    let reservations = read_reservations(&data[hdr.off_mem_rsv..hdr.total_size])?;

    let mut walker = Walker {
        block: struct_block,
        strings: strings_block,
        offset: 0,
    };

    let root = match walker.next_token()? {
        FDT_BEGIN_NODE => {
            let name = walker.read_name()?;
            walker.parse_node(name, 0)?
        }
        _ => return Err(FdtError::InvalidStructure),
    };

    loop {
        match walker.next_token()? {
            FDT_END => break,
            FDT_NOP => {}
            _ => return Err(FdtError::InvalidStructure),
        }
    }

    Ok(ParsedBlob {
        root,
        reservations,
        boot_cpuid: hdr.boot_cpuid,
    })
}

fn read_reservations(data: &[u8]) -> Result<Vec<MemReservation>, FdtError> {
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let address = read_be64(data, offset).ok_or(FdtError::TruncatedData)?;
        let size = read_be64(data, offset + 8).ok_or(FdtError::TruncatedData)?;
        if address == 0 && size == 0 {
            return Ok(out);
        }
        out.push(MemReservation { address, size });
        offset += 16;
    }
}

// ---- Structure block walker -------------------------------------------------

struct Walker<'a> {
    block: &'a [u8],
    strings: &'a [u8],
    offset: usize,
}

impl<'a> Walker<'a> {
    fn next_token(&mut self) -> Result<u32, FdtError> {
        let tag = read_be32(self.block, self.offset).ok_or(FdtError::TruncatedData)?;
        self.offset += 4;
        Ok(tag)
    }

    /// Reads the NUL-terminated node name following a `BEGIN_NODE` token.
    fn read_name(&mut self) -> Result<&'a str, FdtError> {
        let name = str_at(self.block, self.offset)?;
        self.offset = align4(self.offset + name.len() + 1);
        Ok(name)
    }

    fn parse_node(&mut self, name: &str, depth: usize) -> Result<HardwareNode, FdtError> {
        if depth > MAX_DEPTH {
            return Err(FdtError::InvalidStructure);
        }
        let mut builder = HardwareNode::builder(name);

        loop {
            match self.next_token()? {
                FDT_PROP => {
                    let len = read_be32(self.block, self.offset).ok_or(FdtError::TruncatedData)?
                        as usize;
                    let name_off = read_be32(self.block, self.offset + 4)
                        .ok_or(FdtError::TruncatedData)? as usize;
                    let start = self.offset + 8;
                    let end = start.checked_add(len).ok_or(FdtError::InvalidStructure)?;
                    let value = self.block.get(start..end).ok_or(FdtError::TruncatedData)?;
                    let prop_name = str_at(self.strings, name_off)?;
                    builder.push_property(
                        prop_name.to_owned(),
                        TypedValue::decode(prop_name, value),
                    );
                    self.offset = align4(end);
                }
                FDT_BEGIN_NODE => {
                    let child_name = self.read_name()?;
                    let child = self.parse_node(child_name, depth + 1)?;
                    builder.push_child(child);
                }
                FDT_END_NODE => return Ok(builder.build()),
                FDT_NOP => {}
                _ => return Err(FdtError::InvalidStructure),
            }
        }
    }
}

/// Extracts a NUL-terminated UTF-8 string starting at `offset`.
fn str_at(data: &[u8], offset: usize) -> Result<&str, FdtError> {
    let bytes = data.get(offset..).ok_or(FdtError::InvalidStructure)?;
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(FdtError::InvalidStructure)?;
    core::str::from_utf8(&bytes[..end]).map_err(|_| FdtError::InvalidStructure)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- DTB builder helpers ------------------------------------------------

    fn be32(val: u32) -> [u8; 4] {
        val.to_be_bytes()
    }

    fn pad4(v: &mut Vec<u8>) {
        while v.len() % 4 != 0 {
            v.push(0);
        }
    }

    fn emit_begin_node(v: &mut Vec<u8>, name: &str) {
        v.extend_from_slice(&be32(FDT_BEGIN_NODE));
        v.extend_from_slice(name.as_bytes());
        v.push(0);
        pad4(v);
    }

    fn emit_prop(v: &mut Vec<u8>, name_offset: u32, data: &[u8]) {
        v.extend_from_slice(&be32(FDT_PROP));
        v.extend_from_slice(&be32(data.len() as u32));
        v.extend_from_slice(&be32(name_offset));
        v.extend_from_slice(data);
        pad4(v);
    }

    /// Wraps raw blocks in a header plus an empty reservation block.
    fn build_dtb(struct_block: &[u8], strings_block: &[u8]) -> Vec<u8> {
        let mem_rsv_off = FDT_HEADER_SIZE;
        let struct_off = mem_rsv_off + 16;
        let strings_off = struct_off + struct_block.len();
        let total = strings_off + strings_block.len();

        let mut dtb = Vec::with_capacity(total);
        for field in [
            FDT_MAGIC,
            total as u32,
            struct_off as u32,
            strings_off as u32,
            mem_rsv_off as u32,
            17,
            16,
            0,
            strings_block.len() as u32,
            struct_block.len() as u32,
        ] {
            dtb.extend_from_slice(&be32(field));
        }
        dtb.extend_from_slice(&[0; 16]);
        dtb.extend_from_slice(struct_block);
        dtb.extend_from_slice(strings_block);
        dtb
    }

    /// ```text
    /// / {
    ///     #address-cells = <1>;
    ///     uart@1000 {
    ///         compatible = "vendor,uart-v2", "generic,uart";
    ///         reg = <0x1000 0x100>;
    ///     };
    /// };
    /// ```
    fn build_test_dtb() -> Vec<u8> {
        let strings = b"#address-cells\0compatible\0reg\0";
        let mut st = Vec::new();
        emit_begin_node(&mut st, "");
        emit_prop(&mut st, 0, &be32(1));
        emit_begin_node(&mut st, "uart@1000");
        st.extend_from_slice(&be32(FDT_NOP));
        emit_prop(&mut st, 15, b"vendor,uart-v2\0generic,uart\0");
        let mut reg = Vec::new();
        reg.extend_from_slice(&be32(0x1000));
        reg.extend_from_slice(&be32(0x100));
        emit_prop(&mut st, 26, &reg);
        st.extend_from_slice(&be32(FDT_END_NODE));
        st.extend_from_slice(&be32(FDT_END_NODE));
        st.extend_from_slice(&be32(FDT_END));
        build_dtb(&st, strings)
    }

    #[test]
    fn parses_hand_built_blob() {
        let blob = parse(&build_test_dtb()).unwrap();
        assert_eq!(blob.root.name(), "");
        assert_eq!(
            blob.root.find("#address-cells"),
            Some(&TypedValue::Integer(1))
        );
        let uart = blob.root.child("uart@1000").unwrap();
        assert_eq!(uart.compatible(), &["vendor,uart-v2", "generic,uart"]);
        assert_eq!(
            uart.find("reg"),
            Some(&TypedValue::IntegerArray(vec![0x1000, 0x100]))
        );
        assert!(blob.reservations.is_empty());
    }

    #[test]
    fn bad_magic() {
        let mut dtb = build_test_dtb();
        dtb[0] = 0;
        assert_eq!(parse(&dtb).unwrap_err(), FdtError::InvalidMagic);
    }

    #[test]
    fn bad_version() {
        let mut dtb = build_test_dtb();
        dtb[24..28].copy_from_slice(&be32(15));
        assert_eq!(parse(&dtb).unwrap_err(), FdtError::UnsupportedVersion);
    }

    #[test]
    fn truncated() {
        let dtb = build_test_dtb();
        assert_eq!(parse(&dtb[..20]).unwrap_err(), FdtError::TruncatedData);
        assert_eq!(
            parse(&dtb[..dtb.len() - 4]).unwrap_err(),
            FdtError::TruncatedData
        );
    }

    #[test]
    fn unbalanced_nodes() {
        let strings = b"";
        let mut st = Vec::new();
        emit_begin_node(&mut st, "");
        st.extend_from_slice(&be32(FDT_END));
        let dtb = build_dtb(&st, strings);
        assert_eq!(parse(&dtb).unwrap_err(), FdtError::InvalidStructure);
    }

    #[test]
    fn string_offset_out_of_range() {
        let strings = b"reg\0";
        let mut st = Vec::new();
        emit_begin_node(&mut st, "");
        emit_prop(&mut st, 100, &be32(1));
        st.extend_from_slice(&be32(FDT_END_NODE));
        st.extend_from_slice(&be32(FDT_END));
        let dtb = build_dtb(&st, strings);
        assert_eq!(parse(&dtb).unwrap_err(), FdtError::InvalidStructure);
    }
}
