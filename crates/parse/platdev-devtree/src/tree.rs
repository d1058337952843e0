//! The parsed tree and addressing context.

use std::collections::BTreeMap;

use crate::DirectoryError;
use crate::fdt::{self, MemReservation};
use crate::node::HardwareNode;

/// `#address-cells` assumed when the parent does not specify it.
pub const DEFAULT_ADDRESS_CELLS: u32 = 2;
/// `#size-cells` assumed when the parent does not specify it.
pub const DEFAULT_SIZE_CELLS: u32 = 1;
/// `#interrupt-cells` assumed when no interrupt parent can be resolved.
pub const DEFAULT_INTERRUPT_CELLS: u32 = 2;

/// One decoded `reg` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegEntry {
    /// Bus address of the window.
    pub base: u64,
    /// Length of the window in bytes.
    pub size: u64,
}

/// An immutable hardware description tree.
///
/// Built once from a DTB (or from a programmatically assembled root) and
/// then shared read-only.
#[derive(Debug, Clone)]
pub struct DeviceTree {
    root: HardwareNode,
    reservations: Vec<MemReservation>,
    boot_cpuid: u32,
    /// `phandle` → node path.
    phandles: BTreeMap<u32, String>,
}

impl DeviceTree {
    /// Parses a DTB blob.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Fdt`] if the blob is malformed.
    pub fn parse(data: &[u8]) -> Result<Self, DirectoryError> {
        let blob = fdt::reader::parse(data)?;
        log::debug!(
            target: "platdev::devtree",
            "parsed {} byte device tree ({} reservations)",
            data.len(),
            blob.reservations.len()
        );
        let mut tree = Self::from_root(blob.root);
        tree.reservations = blob.reservations;
        tree.boot_cpuid = blob.boot_cpuid;
        Ok(tree)
    }

    /// Wraps an already-built root node.
    #[must_use]
    pub fn from_root(root: HardwareNode) -> Self {
        let mut phandles = BTreeMap::new();
        index_phandles(&root, "", &mut phandles);
        Self {
            root,
            reservations: Vec::new(),
            boot_cpuid: 0,
            phandles,
        }
    }

    /// Returns the root node.
    #[must_use]
    pub fn root(&self) -> &HardwareNode {
        &self.root
    }

    /// Returns the memory reservation entries.
    #[must_use]
    pub fn reservations(&self) -> &[MemReservation] {
        &self.reservations
    }

    /// Returns the physical boot CPU id.
    #[must_use]
    pub fn boot_cpuid(&self) -> u32 {
        self.boot_cpuid
    }

    /// Finds a node by its full path (e.g. `"/soc/uart@1000"`), together with
    /// its addressing context.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<NodeRef<'_>> {
        let mut ctx = Context::root(self);
        let mut current = &self.root;
        let mut full = String::new();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            ctx = ctx.descend(current);
            current = current.child(component)?;
            full.push('/');
            full.push_str(component);
        }
        if full.is_empty() {
            full.push('/');
        }
        Some(ctx.node_ref(self, full, current))
    }

    /// Returns the node whose `phandle` is `handle`.
    #[must_use]
    pub fn by_phandle(&self, handle: u32) -> Option<NodeRef<'_>> {
        self.phandles.get(&handle).and_then(|p| self.find(p))
    }

    /// Returns every node in depth-first pre-order, root first.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeRef<'_>> {
        let mut out = Vec::new();
        let ctx = Context::root(self);
        out.push(ctx.node_ref(self, "/".to_owned(), &self.root));
        self.walk(&self.root, "", &ctx, &mut out);
        out
    }

    fn walk<'a>(
        &'a self,
        node: &'a HardwareNode,
        path: &str,
        ctx: &Context,
        out: &mut Vec<NodeRef<'a>>,
    ) {
        let child_ctx = ctx.descend(node);
        for child in node.children() {
            let child_path = format!("{path}/{}", child.name());
            out.push(child_ctx.node_ref(self, child_path.clone(), child));
            self.walk(child, &child_path, &child_ctx, out);
        }
    }
}

fn index_phandles(node: &HardwareNode, path: &str, out: &mut BTreeMap<u32, String>) {
    let here = if path.is_empty() { "/" } else { path };
    for key in ["phandle", "linux,phandle"] {
        if let Ok(Some(handle)) = node.find_u32(key) {
            out.insert(handle, here.to_owned());
        }
    }
    for child in node.children() {
        index_phandles(child, &format!("{path}/{}", child.name()), out);
    }
}

/// Addressing context inherited from the parent while walking down.
#[derive(Debug, Clone, Copy)]
struct Context {
    address_cells: u32,
    size_cells: u32,
    /// Inherited `interrupt-parent` phandle.
    interrupt_parent: Option<u32>,
}

impl Context {
    fn root(tree: &DeviceTree) -> Self {
        Self {
            address_cells: DEFAULT_ADDRESS_CELLS,
            size_cells: DEFAULT_SIZE_CELLS,
            interrupt_parent: tree.root.find_u32("interrupt-parent").ok().flatten(),
        }
    }

    /// Context for the children of `parent`.
    fn descend(&self, parent: &HardwareNode) -> Self {
        Self {
            address_cells: parent
                .find_u32("#address-cells")
                .ok()
                .flatten()
                .unwrap_or(DEFAULT_ADDRESS_CELLS),
            size_cells: parent
                .find_u32("#size-cells")
                .ok()
                .flatten()
                .unwrap_or(DEFAULT_SIZE_CELLS),
            interrupt_parent: parent
                .find_u32("interrupt-parent")
                .ok()
                .flatten()
                .or(self.interrupt_parent),
        }
    }

    fn node_ref<'a>(
        &self,
        tree: &'a DeviceTree,
        path: String,
        node: &'a HardwareNode,
    ) -> NodeRef<'a> {
        let parent_handle = node
            .find_u32("interrupt-parent")
            .ok()
            .flatten()
            .or(self.interrupt_parent);
        let interrupt_cells = parent_handle
            .and_then(|h| tree.phandles.get(&h))
            .and_then(|p| lookup(&tree.root, p))
            .and_then(|ic| ic.find_u32("#interrupt-cells").ok().flatten())
            .unwrap_or(DEFAULT_INTERRUPT_CELLS);
        NodeRef {
            path,
            node,
            address_cells: self.address_cells,
            size_cells: self.size_cells,
            interrupt_cells,
        }
    }
}

fn lookup<'a>(root: &'a HardwareNode, path: &str) -> Option<&'a HardwareNode> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .try_fold(root, |node, c| node.child(c))
}

/// A node together with the addressing context its parent defines.
#[derive(Debug, Clone)]
pub struct NodeRef<'a> {
    path: String,
    node: &'a HardwareNode,
    address_cells: u32,
    size_cells: u32,
    interrupt_cells: u32,
}

impl<'a> NodeRef<'a> {
    /// Returns the full path of the node.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the node itself.
    #[must_use]
    pub fn node(&self) -> &'a HardwareNode {
        self.node
    }

    /// Parent's `#address-cells`.
    #[must_use]
    pub fn address_cells(&self) -> u32 {
        self.address_cells
    }

    /// Parent's `#size-cells`.
    #[must_use]
    pub fn size_cells(&self) -> u32 {
        self.size_cells
    }

    /// `#interrupt-cells` of the node's interrupt parent.
    #[must_use]
    pub fn interrupt_cells(&self) -> u32 {
        self.interrupt_cells
    }

    fn malformed(&self, property: &str) -> DirectoryError {
        DirectoryError::MalformedProperty {
            node: self.node.name().to_owned(),
            property: property.to_owned(),
        }
    }

    /// Decodes `reg` into address/size pairs. Absent `reg` yields an empty
    /// list.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PropertyTypeMismatch`] if `reg` is not a
    /// cell array and [`DirectoryError::MalformedProperty`] if its length is
    /// not a multiple of the entry size or a value does not fit in 64 bits.
    pub fn reg(&self) -> Result<Vec<RegEntry>, DirectoryError> {
        let Some(cells) = self.node.find_u32_array("reg")? else {
            return Ok(Vec::new());
        };
        let ac = self.address_cells as usize;
        let sc = self.size_cells as usize;
        let stride = ac + sc;
        if ac == 0 || ac > 2 || sc > 2 || cells.len() % stride != 0 {
            return Err(self.malformed("reg"));
        }
        Ok(cells
            .chunks_exact(stride)
            .map(|entry| RegEntry {
                base: combine(&entry[..ac]),
                size: combine(&entry[ac..]),
            })
            .collect())
    }

    /// Splits `interrupts` into per-interrupt specifiers of
    /// [`interrupt_cells`](Self::interrupt_cells) cells each.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::MalformedProperty`] if the property length is
    /// not a multiple of the specifier size.
    pub fn interrupts(&self) -> Result<Vec<Vec<u32>>, DirectoryError> {
        let Some(cells) = self.node.find_u32_array("interrupts")? else {
            return Ok(Vec::new());
        };
        let width = self.interrupt_cells as usize;
        if width == 0 || cells.len() % width != 0 {
            return Err(self.malformed("interrupts"));
        }
        Ok(cells.chunks_exact(width).map(<[u32]>::to_vec).collect())
    }
}

/// Combines big-endian cells into one value (at most two cells).
fn combine(cells: &[u32]) -> u64 {
    cells
        .iter()
        .fold(0u64, |acc, &c| (acc << 32) | u64::from(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypedValue;

    fn board() -> HardwareNode {
        HardwareNode::builder("")
            .property("#address-cells", 2u32)
            .property("#size-cells", 2u32)
            .property("interrupt-parent", 1u32)
            .child(
                HardwareNode::builder("intc@f000")
                    .property("phandle", 1u32)
                    .property("#interrupt-cells", 2u32)
                    .flag("interrupt-controller")
                    .build(),
            )
            .child(
                HardwareNode::builder("soc")
                    .property("#address-cells", 1u32)
                    .property("#size-cells", 1u32)
                    .child(
                        HardwareNode::builder("uart@1000")
                            .compatible(["generic,uart"])
                            .property("reg", [0x1000u32, 0x100, 0x2000, 0x10])
                            .property("interrupts", [5u32, 4, 6, 1])
                            .build(),
                    )
                    .child(
                        HardwareNode::builder("i2c@3000")
                            .property("status", "disabled")
                            .build(),
                    )
                    .build(),
            )
            .child(
                HardwareNode::builder("memory@80000000")
                    .property("reg", [0u32, 0x8000_0000, 0, 0x1000_0000])
                    .build(),
            )
            .build()
    }

    #[test]
    fn find_by_path() {
        let tree = DeviceTree::from_root(board());
        let uart = tree.find("/soc/uart@1000").unwrap();
        assert_eq!(uart.path(), "/soc/uart@1000");
        assert_eq!(uart.node().name(), "uart@1000");
        assert!(tree.find("/soc/spi@4000").is_none());
        assert_eq!(tree.find("/").unwrap().path(), "/");
    }

    #[test]
    fn reg_uses_parent_cells() {
        let tree = DeviceTree::from_root(board());
        let uart = tree.find("/soc/uart@1000").unwrap();
        assert_eq!(uart.address_cells(), 1);
        assert_eq!(
            uart.reg().unwrap(),
            vec![
                RegEntry {
                    base: 0x1000,
                    size: 0x100
                },
                RegEntry {
                    base: 0x2000,
                    size: 0x10
                },
            ]
        );

        let mem = tree.find("/memory@80000000").unwrap();
        assert_eq!(
            mem.reg().unwrap(),
            vec![RegEntry {
                base: 0x8000_0000,
                size: 0x1000_0000
            }]
        );
    }

    #[test]
    fn reg_with_bad_length_is_malformed() {
        let root = HardwareNode::builder("")
            .property("#address-cells", 1u32)
            .property("#size-cells", 1u32)
            .child(
                HardwareNode::builder("dev@0")
                    .property("reg", [0u32, 0x10, 0x20])
                    .build(),
            )
            .build();
        let tree = DeviceTree::from_root(root);
        let err = tree.find("/dev@0").unwrap().reg().unwrap_err();
        assert!(matches!(err, DirectoryError::MalformedProperty { .. }));
    }

    #[test]
    fn interrupts_split_by_controller_cells() {
        let tree = DeviceTree::from_root(board());
        let uart = tree.find("/soc/uart@1000").unwrap();
        assert_eq!(uart.interrupt_cells(), 2);
        assert_eq!(uart.interrupts().unwrap(), vec![vec![5, 4], vec![6, 1]]);
    }

    #[test]
    fn phandle_lookup() {
        let tree = DeviceTree::from_root(board());
        let intc = tree.by_phandle(1).unwrap();
        assert_eq!(intc.path(), "/intc@f000");
        assert_eq!(
            intc.node().find("interrupt-controller"),
            Some(&TypedValue::Boolean(true))
        );
    }

    #[test]
    fn depth_first_order() {
        let tree = DeviceTree::from_root(board());
        let paths: Vec<String> = tree.nodes().iter().map(|n| n.path().to_owned()).collect();
        assert_eq!(
            paths,
            [
                "/",
                "/intc@f000",
                "/soc",
                "/soc/uart@1000",
                "/soc/i2c@3000",
                "/memory@80000000"
            ]
        );
    }
}
