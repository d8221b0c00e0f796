//! Builders for synthetic heap images used across the unit tests

use crate::codec::{LfhBlockOffsets, VsChunkHeaderSize};
use crate::layout::{
    BALANCED_NODE, LFH_SUBSEGMENT, LIST_ENTRY, Layout, PAGE_RANGE_DESCRIPTOR, VS_CHUNK_FREE_HEADER,
};
use crate::memory::{Snapshot, Target};
use crate::segment::TREE_SIGNATURE;

pub const GLOBALS: u64 = 0xfffff802_1c400000;
pub const HEAP_KEY: u64 = 0x5a5a_1234_9876_abcd;
pub const LFH_KEY: u32 = 0xaabbccdd;

pub struct Image {
    pub snapshot: Snapshot,
    pub layout: &'static Layout,
}

impl Image {
    /// 64-bit kernel image with the heap globals mapped
    pub fn new() -> Self {
        let mut image = Self { snapshot: Snapshot::new(), layout: Layout::nt_x64() };
        image.map(GLOBALS, 0x10);
        image.snapshot.write_u64(GLOBALS, HEAP_KEY).unwrap();
        image.snapshot.write_u32(GLOBALS + 8, LFH_KEY).unwrap();
        image.snapshot.add_global("nt", "RtlpHpHeapGlobals", GLOBALS);
        image
    }

    pub fn map(&mut self, address: u64, len: usize) {
        self.snapshot.add_zeroed(address, len).unwrap();
    }

    /// Write `value` into `structure.field` of the object at `address`
    pub fn set(&mut self, structure: &str, address: u64, field: &str, value: u64) {
        let f = self.layout.field(structure, field).unwrap();
        let at = address + f.offset;
        let value = match f.bitfield {
            Some(bits) => {
                let mask = ((1u64 << bits.length) - 1) << bits.position;
                let current = self.snapshot.read(at, f.width).unwrap();
                (current & !mask) | ((value << bits.position) & mask)
            }
            None => value,
        };
        self.snapshot.write(at, f.width, value).unwrap();
    }

    pub fn offset(&self, structure: &str, field: &str) -> u64 {
        self.layout.offset_of(structure, field).unwrap()
    }

    /// Link `entries` into a circular `_LIST_ENTRY` list anchored at `head`
    pub fn link_list(&mut self, head: u64, entries: &[u64]) {
        let mut chain = vec![head];
        chain.extend_from_slice(entries);
        chain.push(head);
        for pair in chain.windows(2) {
            self.set(LIST_ENTRY, pair[0], "Flink", pair[1]);
            self.set(LIST_ENTRY, pair[1], "Blink", pair[0]);
        }
    }

    pub fn page_range(&mut self, segment: u64, index: u64, unit_size: u8, flags: u8) {
        let size = self.layout.size_of(PAGE_RANGE_DESCRIPTOR).unwrap();
        let slot = segment + index * size;
        self.set(PAGE_RANGE_DESCRIPTOR, slot, "TreeSignature", TREE_SIGNATURE);
        self.set(PAGE_RANGE_DESCRIPTOR, slot, "UnitSize", unit_size.into());
        self.set(PAGE_RANGE_DESCRIPTOR, slot, "RangeFlags", flags.into());
    }

    /// Fill in an LFH subsegment header with encoded offsets and a block bitmap where
    /// the blocks in `busy` are marked busy
    pub fn lfh_subsegment(
        &mut self,
        address: u64,
        block_count: u16,
        offsets: LfhBlockOffsets,
        busy: &[u64],
    ) {
        let (raw_size, raw_offset) = offsets.encode(LFH_KEY, address).unwrap();
        self.set(LFH_SUBSEGMENT, address, "BlockCount", block_count.into());
        self.set(LFH_SUBSEGMENT, address, "BlockOffsets.BlockSize", raw_size.into());
        self.set(LFH_SUBSEGMENT, address, "BlockOffsets.FirstBlockOffset", raw_offset.into());

        let bitmap = address + self.offset(LFH_SUBSEGMENT, "BlockBitmap");
        for chunk in 0..u64::from(block_count).div_ceil(32) {
            let mut value = 0;
            for block in busy.iter().filter(|b| **b / 32 == chunk) {
                let bit = (block * 2) % 64;
                value |= 1u64 << (8 * (bit / 8) + 6 - bit % 8);
            }
            // unmapped chunks are left alone so tests can cut the bitmap short
            if self.snapshot.read(bitmap + chunk * 8, crate::memory::Width::Qword).is_ok() {
                self.snapshot.write_u64(bitmap + chunk * 8, value).unwrap();
            }
        }
    }

    /// Store an encoded free chunk header in front of the tree node at `node`
    pub fn vs_chunk(&mut self, node: u64, unsafe_size: u16, unsafe_prev_size: u16) {
        let header_address = node - self.offset(VS_CHUNK_FREE_HEADER, "Node");
        let header = VsChunkHeaderSize {
            memory_cost: 0,
            unsafe_size,
            unsafe_prev_size,
            allocated: 0,
            extra: 0,
        };
        let raw = header.encode(HEAP_KEY, header_address).unwrap();
        self.set(VS_CHUNK_FREE_HEADER, header_address, "OverlapsHeader", raw);
    }

    /// Set the children of the tree node at `node`, XOR'd with `tree` when encoded
    pub fn vs_children(&mut self, node: u64, left: u64, right: u64, tree: Option<u64>) {
        let encode = |child: u64| match tree {
            Some(tree) if child != 0 => child ^ tree,
            _ => child,
        };
        self.set(BALANCED_NODE, node, "Left", encode(left));
        self.set(BALANCED_NODE, node, "Right", encode(right));
    }
}
