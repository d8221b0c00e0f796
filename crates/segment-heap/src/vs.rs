//! Variable Size allocator front-end

use std::collections::HashSet;

use log::{debug, error, warn};

use crate::codec::{HeapKeys, VsChunkHeaderSize};
use crate::error::{Error, Result};
use crate::layout::{BALANCED_NODE, TypedObject, VS_CHUNK_FREE_HEADER};

/// Deepest node visited in the free chunk tree
pub const MAX_TREE_DEPTH: usize = 128;
/// Upper bound on the nodes collected from one tree
pub const MAX_TREE_NODES: usize = 0x10000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockType {
    Paged,
    NonPaged,
    TypeMax(u32),
}

impl From<u32> for LockType {
    fn from(value: u32) -> Self {
        match value {
            0 => LockType::Paged,
            1 => LockType::NonPaged,
            n => LockType::TypeMax(n),
        }
    }
}

impl LockType {
    pub fn name(&self) -> &'static str {
        match self {
            LockType::Paged => "HeapLockPaged",
            LockType::NonPaged => "HeapLockNonPaged",
            LockType::TypeMax(_) => "HeapLockTypeMax",
        }
    }
}

/// A free VS chunk found in the tree
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VsChunkFreeHeader {
    /// Start of the `_HEAP_VS_CHUNK_FREE_HEADER`
    pub address: u64,
    /// The `_RTL_BALANCED_NODE` inside the header
    pub node: u64,
    /// Encoded header as stored
    pub raw: u64,
    pub header: VsChunkHeaderSize,
}

impl VsChunkFreeHeader {
    pub fn read(header: TypedObject<'_>, node: u64, keys: &HeapKeys) -> Result<Self> {
        let address = header.address();
        let raw = header.read("OverlapsHeader")?;
        let header = VsChunkHeaderSize::decode(keys.heap_key, address, raw)?;
        Ok(Self { address, node, raw, header })
    }

    pub fn size(&self) -> u64 {
        self.header.size()
    }

    pub fn prev_size(&self) -> u64 {
        self.header.prev_size()
    }

    pub fn is_allocated(&self) -> bool {
        self.header.is_allocated()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsContext {
    pub address: u64,
    pub lock_type: LockType,
    pub flags: u32,
    pub backend_ctx: u64,
    pub total_committed_units: u64,
    pub free_committed_units: u64,
    /// Address of `FreeChunkTree`, the key for encoded child links
    pub tree: u64,
    pub root: u64,
    pub encoded: bool,
    pub free_chunks: Vec<VsChunkFreeHeader>,
}

impl VsContext {
    pub fn read(context: TypedObject<'_>, keys: &HeapKeys) -> Result<Self> {
        let address = context.address();
        let lock_type = LockType::from(context.read("LockType")? as u32);
        let flags = context.read("Config.Flags")? as u32;
        let backend_ctx = context.read("BackendCtx")?;
        let total_committed_units = context.read("TotalCommittedUnits")?;
        let free_committed_units = context.read("FreeCommittedUnits")?;

        let tree = context.field_address("FreeChunkTree")?;
        let root = context.read("FreeChunkTree.Root")?;
        let encoded = context.read("FreeChunkTree.Encoded")? != 0;

        let free_chunks = walk_free_chunks(context, tree, root, encoded, keys)?;
        debug!("vs context 0x{address:x}: {} free chunks", free_chunks.len());

        Ok(Self {
            address,
            lock_type,
            flags,
            backend_ctx,
            total_committed_units,
            free_committed_units,
            tree,
            root,
            encoded,
            free_chunks,
        })
    }
}

/// Pre-order walk of the free chunk tree rooted at `root`.
///
/// When `encoded` is set every non-null child link is XOR'd with `tree`. A node that
/// cannot be read is logged and its subtree skipped. Repeated nodes, nodes deeper than
/// [`MAX_TREE_DEPTH`], and anything past [`MAX_TREE_NODES`] are dropped with a warning.
pub fn walk_free_chunks(
    context: TypedObject<'_>,
    tree: u64,
    root: u64,
    encoded: bool,
    keys: &HeapKeys,
) -> Result<Vec<VsChunkFreeHeader>> {
    let layout = context.layout();
    let node_offset = layout.offset_of(VS_CHUNK_FREE_HEADER, "Node")?;
    layout.field(BALANCED_NODE, "Left")?;
    layout.field(BALANCED_NODE, "Right")?;

    let decode = |link: u64| if encoded { link ^ tree } else { link };
    let malformed = |reason: String| Error::MalformedTree { root, reason };

    let mut chunks = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = Vec::new();
    if root != 0 {
        stack.push((root, 0));
    }

    while let Some((node, depth)) = stack.pop() {
        if !seen.insert(node) {
            warn!("{}", malformed(format!("node 0x{node:x} repeats")));
            continue;
        }
        if depth > MAX_TREE_DEPTH {
            warn!("{}", malformed(format!("node 0x{node:x} deeper than {MAX_TREE_DEPTH}")));
            continue;
        }
        if chunks.len() == MAX_TREE_NODES {
            warn!("{}", malformed(format!("more than {MAX_TREE_NODES} nodes")));
            break;
        }

        let header = context.cast(VS_CHUNK_FREE_HEADER, node.wrapping_sub(node_offset));
        match VsChunkFreeHeader::read(header, node, keys) {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => {
                error!("vs free chunk node 0x{node:x}: {e}");
                continue;
            }
        }

        // right goes on the stack first so the left subtree is visited first
        let balanced = context.cast(BALANCED_NODE, node);
        for side in ["Right", "Left"] {
            match balanced.read(side) {
                Ok(0) => {}
                Ok(link) => stack.push((decode(link), depth + 1)),
                Err(e) => error!("vs free chunk node 0x{node:x} {side}: {e}"),
            }
        }
    }

    Ok(chunks)
}
