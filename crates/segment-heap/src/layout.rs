//! Structure layout table and a generic field reader.
//!
//! The decoders never hard-code an offset. Every field is looked up by
//! `(structure, field)` in a [`Layout`], and nested fields of embedded structures are
//! flattened into dotted paths (`FreeChunkTree.Root`). The built-in table describes the
//! x64 `nt` structures of Windows 10 20H1 and later; a text table can override any entry
//! for other builds.

use std::collections::HashMap;
use std::sync::LazyLock;

use log::debug;
use regex::Regex;

use crate::error::{Error, Result};
use crate::memory::{Target, Width};

pub const SEGMENT_HEAP: &str = "_SEGMENT_HEAP";
pub const SEG_CONTEXT: &str = "_HEAP_SEG_CONTEXT";
pub const PAGE_SEGMENT: &str = "_HEAP_PAGE_SEGMENT";
pub const PAGE_RANGE_DESCRIPTOR: &str = "_HEAP_PAGE_RANGE_DESCRIPTOR";
pub const LFH_CONTEXT: &str = "_HEAP_LFH_CONTEXT";
pub const LFH_BUCKET: &str = "_HEAP_LFH_BUCKET";
pub const LFH_AFFINITY_SLOT: &str = "_HEAP_LFH_AFFINITY_SLOT";
pub const LFH_SUBSEGMENT: &str = "_HEAP_LFH_SUBSEGMENT";
pub const VS_CONTEXT: &str = "_HEAP_VS_CONTEXT";
pub const VS_CHUNK_FREE_HEADER: &str = "_HEAP_VS_CHUNK_FREE_HEADER";
pub const BALANCED_NODE: &str = "_RTL_BALANCED_NODE";
pub const LIST_ENTRY: &str = "_LIST_ENTRY";
pub const HEAP_GLOBALS: &str = "_RTLP_HP_HEAP_GLOBALS";

/// A bit range inside a field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bitfield {
    pub position: u8,
    pub length: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    pub offset: u64,
    pub width: Width,
    pub bitfield: Option<Bitfield>,
}

impl Field {
    pub const fn new(offset: u64, width: Width) -> Self {
        Self { offset, width, bitfield: None }
    }

    pub const fn bits(offset: u64, width: Width, position: u8, length: u8) -> Self {
        Self { offset, width, bitfield: Some(Bitfield { position, length }) }
    }

    /// Apply the bitfield (if any) to a raw value of this field
    pub fn extract(&self, raw: u64) -> u64 {
        match self.bitfield {
            Some(Bitfield { position, length }) if length < 64 => {
                (raw >> position) & ((1 << length) - 1)
            }
            Some(Bitfield { position, .. }) => raw >> position,
            None => raw,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructLayout {
    pub size: Option<u64>,
    fields: HashMap<String, Field>,
}

#[derive(Debug, Clone, Default)]
pub struct Layout {
    structs: HashMap<String, StructLayout>,
}

use Width::{Byte, Dword, Qword, Word};

#[rustfmt::skip]
const NT_X64_FIELDS: &[(&str, &str, Field)] = &[
    (SEGMENT_HEAP, "Signature", Field::new(0x10, Dword)),
    (SEGMENT_HEAP, "GlobalFlags", Field::new(0x14, Dword)),
    (SEGMENT_HEAP, "SegContexts", Field::new(0x100, Qword)),
    (SEGMENT_HEAP, "VsContext", Field::new(0x280, Qword)),
    (SEGMENT_HEAP, "LfhContext", Field::new(0x340, Qword)),

    (SEG_CONTEXT, "SegmentMask", Field::new(0x0, Qword)),
    (SEG_CONTEXT, "UnitShift", Field::new(0x8, Byte)),
    (SEG_CONTEXT, "PagesPerUnitShift", Field::new(0x9, Byte)),
    (SEG_CONTEXT, "MaxAllocationSize", Field::new(0x10, Dword)),
    (SEG_CONTEXT, "Heap", Field::new(0x38, Qword)),
    (SEG_CONTEXT, "SegmentListHead", Field::new(0x48, Qword)),
    (SEG_CONTEXT, "SegmentCount", Field::new(0x58, Qword)),

    (PAGE_SEGMENT, "ListEntry", Field::new(0x0, Qword)),
    (PAGE_SEGMENT, "Signature", Field::new(0x10, Qword)),
    (PAGE_SEGMENT, "DescArray", Field::new(0x0, Qword)),

    (PAGE_RANGE_DESCRIPTOR, "TreeSignature", Field::new(0x0, Dword)),
    (PAGE_RANGE_DESCRIPTOR, "RangeFlags", Field::new(0x18, Byte)),
    (PAGE_RANGE_DESCRIPTOR, "CommittedPageCount", Field::new(0x19, Byte)),
    (PAGE_RANGE_DESCRIPTOR, "UnitSize", Field::new(0x1f, Byte)),

    (LFH_CONTEXT, "BackendCtx", Field::new(0x0, Qword)),
    (LFH_CONTEXT, "MaxAffinity", Field::new(0x40, Byte)),
    (LFH_CONTEXT, "Config.MaxBlockSize", Field::new(0x44, Word)),
    (LFH_CONTEXT, "Config.WitholdPageCrossingBlocks", Field::bits(0x46, Word, 0, 1)),
    (LFH_CONTEXT, "Config.DisableRandomization", Field::bits(0x46, Word, 1, 1)),
    (LFH_CONTEXT, "Buckets", Field::new(0x80, Qword)),

    (LFH_BUCKET, "TotalBlockCount", Field::new(0x38, Qword)),
    (LFH_BUCKET, "TotalSubsegmentCount", Field::new(0x40, Qword)),
    (LFH_BUCKET, "AffinitySlots", Field::new(0x60, Qword)),

    (LFH_AFFINITY_SLOT, "State.AvailableSubsegmentCount", Field::new(0x8, Qword)),
    (LFH_AFFINITY_SLOT, "State.AvailableSubsegmentList", Field::new(0x18, Qword)),
    (LFH_AFFINITY_SLOT, "State.FullSubsegmentList", Field::new(0x28, Qword)),
    (LFH_AFFINITY_SLOT, "ActiveSubsegment", Field::new(0x38, Qword)),

    (LFH_SUBSEGMENT, "ListEntry", Field::new(0x0, Qword)),
    (LFH_SUBSEGMENT, "Owner", Field::new(0x10, Qword)),
    (LFH_SUBSEGMENT, "FreeCount", Field::new(0x20, Word)),
    (LFH_SUBSEGMENT, "BlockCount", Field::new(0x22, Word)),
    (LFH_SUBSEGMENT, "FreeHint", Field::new(0x24, Word)),
    (LFH_SUBSEGMENT, "Location", Field::new(0x26, Byte)),
    (LFH_SUBSEGMENT, "BlockOffsets.BlockSize", Field::new(0x28, Word)),
    (LFH_SUBSEGMENT, "BlockOffsets.FirstBlockOffset", Field::new(0x2a, Word)),
    (LFH_SUBSEGMENT, "BlockBitmap", Field::new(0x30, Qword)),

    (VS_CONTEXT, "LockType", Field::new(0x8, Dword)),
    (VS_CONTEXT, "FreeChunkTree", Field::new(0x10, Qword)),
    (VS_CONTEXT, "FreeChunkTree.Root", Field::new(0x10, Qword)),
    (VS_CONTEXT, "FreeChunkTree.Encoded", Field::bits(0x18, Byte, 0, 1)),
    (VS_CONTEXT, "TotalCommittedUnits", Field::new(0x30, Qword)),
    (VS_CONTEXT, "FreeCommittedUnits", Field::new(0x38, Qword)),
    (VS_CONTEXT, "BackendCtx", Field::new(0x80, Qword)),
    (VS_CONTEXT, "Config.Flags", Field::new(0xb8, Dword)),

    (VS_CHUNK_FREE_HEADER, "OverlapsHeader", Field::new(0x0, Qword)),
    (VS_CHUNK_FREE_HEADER, "Node", Field::new(0x8, Qword)),

    (BALANCED_NODE, "Left", Field::new(0x0, Qword)),
    (BALANCED_NODE, "Right", Field::new(0x8, Qword)),
    (BALANCED_NODE, "ParentValue", Field::new(0x10, Qword)),

    (LIST_ENTRY, "Flink", Field::new(0x0, Qword)),
    (LIST_ENTRY, "Blink", Field::new(0x8, Qword)),

    (HEAP_GLOBALS, "HeapKey", Field::new(0x0, Qword)),
    (HEAP_GLOBALS, "LfhKey", Field::new(0x8, Dword)),
];

const NT_X64_SIZES: &[(&str, u64)] = &[
    (SEG_CONTEXT, 0xc0),
    (PAGE_SEGMENT, 0x2000),
    (PAGE_RANGE_DESCRIPTOR, 0x20),
    (LFH_AFFINITY_SLOT, 0x40),
    (LFH_SUBSEGMENT, 0x38),
    (VS_CHUNK_FREE_HEADER, 0x20),
    (BALANCED_NODE, 0x18),
    (LIST_ENTRY, 0x10),
];

static NT_X64: LazyLock<Layout> = LazyLock::new(|| {
    let mut layout = Layout::default();
    for (structure, name, field) in NT_X64_FIELDS {
        layout.insert(structure, name, *field);
    }
    for (structure, size) in NT_X64_SIZES {
        layout.set_size(structure, *size);
    }
    layout
});

impl Layout {
    /// Built-in table for 64-bit `nt`
    pub fn nt_x64() -> &'static Layout {
        &NT_X64
    }

    pub fn insert(&mut self, structure: &str, field: &str, value: Field) {
        self.structs.entry(structure.to_owned()).or_default().fields.insert(field.to_owned(), value);
    }

    pub fn set_size(&mut self, structure: &str, size: u64) {
        self.structs.entry(structure.to_owned()).or_default().size = Some(size);
    }

    pub fn field(&self, structure: &str, field: &str) -> Result<Field> {
        self.structs.get(structure).and_then(|s| s.fields.get(field)).copied().ok_or_else(|| {
            Error::UnknownField { structure: structure.to_owned(), field: field.to_owned() }
        })
    }

    pub fn offset_of(&self, structure: &str, field: &str) -> Result<u64> {
        self.field(structure, field).map(|f| f.offset)
    }

    pub fn size_of(&self, structure: &str) -> Result<u64> {
        self.structs.get(structure).and_then(|s| s.size).ok_or_else(|| Error::UnknownField {
            structure: structure.to_owned(),
            field: "<size>".to_owned(),
        })
    }

    /// Copy every entry of `other` over this table
    pub fn merge(&mut self, other: &Layout) {
        for (name, s) in &other.structs {
            let entry = self.structs.entry(name.clone()).or_default();
            if s.size.is_some() {
                entry.size = s.size;
            }
            for (field, value) in &s.fields {
                entry.fields.insert(field.clone(), *value);
            }
        }
    }

    /// Parse a layout table.
    ///
    /// ```text
    /// # comment
    /// _HEAP_LFH_SUBSEGMENT size 0x38
    /// _HEAP_LFH_SUBSEGMENT.BlockCount 0x22 2
    /// _HEAP_LFH_CONTEXT.Config.DisableRandomization 0x46 2 bit 1 1
    /// ```
    ///
    /// The width defaults to 8 bytes.
    pub fn parse(text: &str) -> Result<Layout> {
        static RE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r"^(\w+)\.([\w.\[\]]+)\s+(0x[0-9a-fA-F]+|\d+)(?:\s+(\d+))?(?:\s+bit\s+(\d+)\s+(\d+))?$",
            )
            .unwrap()
        });
        static RE_SIZE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^(\w+)\s+size\s+(0x[0-9a-fA-F]+|\d+)$").unwrap());

        let mut layout = Layout::default();
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let invalid = |reason: &str| Error::InvalidLayout { line: line_no, reason: reason.to_owned() };

            if let Some(caps) = RE_SIZE.captures(line) {
                let size = parse_number(&caps[2]).ok_or_else(|| invalid("bad size"))?;
                layout.set_size(&caps[1], size);
                continue;
            }

            let Some(caps) = RE_FIELD.captures(line) else {
                return Err(invalid("expected `<STRUCT>.<Field> <offset> [<width>] [bit <pos> <len>]`"));
            };
            let offset = parse_number(&caps[3]).ok_or_else(|| invalid("bad offset"))?;
            let width = match caps.get(4) {
                Some(w) => w
                    .as_str()
                    .parse()
                    .ok()
                    .and_then(Width::from_len)
                    .ok_or_else(|| invalid("width must be 1, 2, 4 or 8"))?,
                None => Width::Qword,
            };
            let bitfield = match (caps.get(5), caps.get(6)) {
                (Some(position), Some(length)) => {
                    let position: u8 = position.as_str().parse().map_err(|_| invalid("bad bit position"))?;
                    let length: u8 = length.as_str().parse().map_err(|_| invalid("bad bit length"))?;
                    if length == 0 || usize::from(position) + usize::from(length) > width.len() * 8 {
                        return Err(invalid("bit range does not fit the field width"));
                    }
                    Some(Bitfield { position, length })
                }
                _ => None,
            };
            layout.insert(&caps[1], &caps[2], Field { offset, width, bitfield });
        }

        debug!("parsed layout with {} structures", layout.structs.len());
        Ok(layout)
    }

    /// View `address` as a `structure`
    pub fn object<'a>(
        &'a self,
        target: &'a dyn Target,
        structure: &'a str,
        address: u64,
    ) -> TypedObject<'a> {
        TypedObject { target, layout: self, structure, address }
    }
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// A structure at an address in the target, read field by field through the layout
#[derive(Clone, Copy)]
pub struct TypedObject<'a> {
    target: &'a dyn Target,
    layout: &'a Layout,
    structure: &'a str,
    address: u64,
}

impl<'a> TypedObject<'a> {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn structure(&self) -> &str {
        self.structure
    }

    /// Address of `field` inside this object
    pub fn field_address(&self, field: &str) -> Result<u64> {
        let field = self.layout.field(self.structure, field)?;
        Ok(self.address.wrapping_add(field.offset))
    }

    pub fn read(&self, field: &str) -> Result<u64> {
        let f = self.layout.field(self.structure, field)?;
        let raw = self.target.read(self.address.wrapping_add(f.offset), f.width)?;
        Ok(f.extract(raw))
    }

    /// Read element `index` of an array of scalars starting at `field`
    pub fn read_element(&self, field: &str, index: u64) -> Result<u64> {
        let f = self.layout.field(self.structure, field)?;
        let address = self.address.wrapping_add(f.offset).wrapping_add(index * f.width.len() as u64);
        self.target.read(address, f.width)
    }

    /// Element `index` of an array of `element` structures starting at `field`
    pub fn element(&self, field: &str, element: &'a str, index: u64) -> Result<TypedObject<'a>> {
        let base = self.field_address(field)?;
        let size = self.layout.size_of(element)?;
        Ok(self.cast(element, base.wrapping_add(index * size)))
    }

    /// View another address through the same target and layout
    pub fn cast(&self, structure: &'a str, address: u64) -> TypedObject<'a> {
        TypedObject { target: self.target, layout: self.layout, structure, address }
    }

    pub fn target(&self) -> &'a dyn Target {
        self.target
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }
}
