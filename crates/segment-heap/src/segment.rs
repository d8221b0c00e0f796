use log::{debug, error};

use crate::error::Result;
use crate::layout::{PAGE_RANGE_DESCRIPTOR, PAGE_SEGMENT, TypedObject};
use crate::list::list_records;

/// Magic in `_HEAP_PAGE_RANGE_DESCRIPTOR.TreeSignature` of the first slot of a range
pub const TREE_SIGNATURE: u64 = 0xccddccdd;
pub const PAGE_SIZE: u64 = 0x1000;
/// Descriptor slots per page segment
pub const DESCRIPTOR_SLOTS: u64 = 256;
/// Slots 0 and 1 describe the segment itself
pub const FIRST_DATA_SLOT: u64 = 2;

/// What a page range is used for, from `RangeFlags`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RangeKind {
    LfhSubsegment,
    VsSubsegment,
    LargePoolSubsegment,
    Unknown(u8),
}

impl From<u8> for RangeKind {
    fn from(flags: u8) -> Self {
        match flags {
            11 => RangeKind::LfhSubsegment,
            15 => RangeKind::VsSubsegment,
            3 => RangeKind::LargePoolSubsegment,
            n => RangeKind::Unknown(n),
        }
    }
}

impl RangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            RangeKind::LfhSubsegment => "LFH_SUBSEGMENT",
            RangeKind::VsSubsegment => "VS_SUBSEGMENT",
            RangeKind::LargePoolSubsegment => "Large Pool Subsegment",
            RangeKind::Unknown(_) => "Unknown Subsegment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRangeDescriptor {
    /// Address of the descriptor slot
    pub address: u64,
    pub index: u64,
    pub unit_size: u64,
    pub kind: RangeKind,
    pub committed_page_count: u8,
    pub base: u64,
    pub end: u64,
}

impl PageRangeDescriptor {
    pub fn size(&self) -> u64 {
        self.end - self.base
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.base..self.end).contains(&address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSegment {
    pub address: u64,
    pub signature: u64,
    pub ranges: Vec<PageRangeDescriptor>,
}

impl PageSegment {
    /// Scan the descriptor array of the `_HEAP_PAGE_SEGMENT` at `segment`.
    ///
    /// A range of `UnitSize` units owns that many consecutive slots; only its first slot
    /// carries the signature, so the scan jumps over the rest.
    pub fn read(segment: TypedObject<'_>) -> Result<Self> {
        let address = segment.address();
        let signature = segment.read("Signature")?;

        let mut ranges = Vec::new();
        let mut index = FIRST_DATA_SLOT;
        while index < DESCRIPTOR_SLOTS {
            let slot = segment.element("DescArray", PAGE_RANGE_DESCRIPTOR, index)?;
            match read_range(slot, address, index) {
                Ok(Some(range)) => {
                    index += range.unit_size;
                    ranges.push(range);
                }
                Ok(None) => index += 1,
                Err(e) => {
                    error!("page segment 0x{address:x} slot {index}: {e}");
                    index += 1;
                }
            }
        }

        debug!("page segment 0x{address:x}: {} ranges", ranges.len());
        Ok(Self { address, signature, ranges })
    }
}

fn read_range(slot: TypedObject<'_>, segment: u64, index: u64) -> Result<Option<PageRangeDescriptor>> {
    if slot.read("TreeSignature")? != TREE_SIGNATURE {
        return Ok(None);
    }

    // a zero unit size would stall the scan
    let unit_size = slot.read("UnitSize")?.max(1);
    let kind = RangeKind::from(slot.read("RangeFlags")? as u8);
    let committed_page_count = slot.read("CommittedPageCount")? as u8;
    let base = segment.wrapping_add(index * PAGE_SIZE);
    let end = base.wrapping_add(unit_size * PAGE_SIZE);

    Ok(Some(PageRangeDescriptor {
        address: slot.address(),
        index,
        unit_size,
        kind,
        committed_page_count,
        base,
        end,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegContext {
    pub address: u64,
    pub heap: u64,
    pub segment_mask: u64,
    pub unit_shift: u8,
    /// As reported by the heap, may disagree with `segments.len()`
    pub segment_count: u64,
    pub segments: Vec<PageSegment>,
}

impl SegContext {
    pub fn read(context: TypedObject<'_>) -> Result<Self> {
        let address = context.address();
        let heap = context.read("Heap")?;
        let segment_mask = context.read("SegmentMask")?;
        let unit_shift = context.read("UnitShift")? as u8;
        let segment_count = context.read("SegmentCount")?;

        let head = context.field_address("SegmentListHead")?;
        let records =
            list_records(context.target(), context.layout(), head, PAGE_SEGMENT, "ListEntry")?;

        let mut segments = Vec::with_capacity(records.len());
        for record in records {
            match PageSegment::read(context.cast(PAGE_SEGMENT, record)) {
                Ok(segment) => segments.push(segment),
                Err(e) => error!("page segment 0x{record:x}: {e}"),
            }
        }

        if segments.len() as u64 != segment_count {
            debug!(
                "seg context 0x{address:x}: SegmentCount {segment_count}, walked {}",
                segments.len()
            );
        }

        Ok(Self { address, heap, segment_mask, unit_shift, segment_count, segments })
    }
}
