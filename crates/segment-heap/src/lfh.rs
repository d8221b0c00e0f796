//! Low Fragmentation Heap front-end

use log::{debug, error, warn};

use crate::codec::{HeapKeys, LfhBlockOffsets};
use crate::error::Result;
use crate::layout::{LFH_AFFINITY_SLOT, LFH_BUCKET, LFH_SUBSEGMENT, TypedObject};
use crate::list::list_records;

/// Number of entries in `_HEAP_LFH_CONTEXT.Buckets`
pub const MAX_BUCKETS: u64 = 129;

/// Reference count bits packed into `ActiveSubsegment`
const FAST_REF_MASK: u64 = 0xfff;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubsegmentLocation {
    AvailableSubsegmentList,
    FullSubsegmentList,
    Unknown(u8),
}

impl From<u8> for SubsegmentLocation {
    fn from(location: u8) -> Self {
        match location {
            0 => SubsegmentLocation::AvailableSubsegmentList,
            1 => SubsegmentLocation::FullSubsegmentList,
            n => SubsegmentLocation::Unknown(n),
        }
    }
}

impl SubsegmentLocation {
    pub fn name(&self) -> &'static str {
        match self {
            SubsegmentLocation::AvailableSubsegmentList => "AvailableSubsegmentList",
            SubsegmentLocation::FullSubsegmentList => "FullSubsegmentList",
            SubsegmentLocation::Unknown(_) => "Unknown",
        }
    }
}

/// One block of a subsegment with its two bitmap bits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LfhBlockState {
    pub address: u64,
    /// `None` when the bitmap chunk holding the bits could not be read
    pub bits: Option<u8>,
}

impl LfhBlockState {
    pub fn is_busy(&self) -> Option<bool> {
        self.bits.map(|bits| bits & 1 == 1)
    }

    pub fn state(&self) -> &'static str {
        match self.is_busy() {
            Some(true) => "Busy",
            Some(false) => "Free",
            None => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfhSubsegment {
    pub address: u64,
    pub free_count: u16,
    pub block_count: u16,
    pub free_hint: u16,
    pub location: SubsegmentLocation,
    pub block_size: u64,
    pub first_block_offset: u64,
    pub blocks: Vec<LfhBlockState>,
}

impl LfhSubsegment {
    pub fn read(subsegment: TypedObject<'_>, keys: &HeapKeys) -> Result<Self> {
        let address = subsegment.address();
        let free_count = subsegment.read("FreeCount")? as u16;
        let block_count = subsegment.read("BlockCount")? as u16;
        let free_hint = subsegment.read("FreeHint")? as u16;
        let location = SubsegmentLocation::from(subsegment.read("Location")? as u8);

        let raw_size = subsegment.read("BlockOffsets.BlockSize")? as u16;
        let raw_offset = subsegment.read("BlockOffsets.FirstBlockOffset")? as u16;
        let offsets = LfhBlockOffsets::decode(keys.lfh_key, address, raw_size, raw_offset)?;
        debug!(
            "subsegment 0x{address:x}: {block_count} blocks of 0x{:x} at +0x{:x}",
            offsets.block_size, offsets.first_block_offset
        );

        let blocks = read_blocks(subsegment, block_count, &offsets)?;

        Ok(Self {
            address,
            free_count,
            block_count,
            free_hint,
            location,
            block_size: offsets.block_size.into(),
            first_block_offset: offsets.first_block_offset.into(),
            blocks,
        })
    }

    pub fn busy_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_busy() == Some(true)).count()
    }
}

/// Pair every block with its bits from `BlockBitmap`.
///
/// Block `n` owns bits `2n` and `2n + 1`, counted from the most significant end of each
/// bitmap byte. Each 64 bit chunk of the bitmap is read once.
fn read_blocks(
    subsegment: TypedObject<'_>,
    block_count: u16,
    offsets: &LfhBlockOffsets,
) -> Result<Vec<LfhBlockState>> {
    let base = subsegment.address();
    subsegment.field_address("BlockBitmap")?;

    let first = u64::from(offsets.first_block_offset);
    let size = u64::from(offsets.block_size);
    let mut blocks = Vec::with_capacity(block_count.into());
    let mut cached: Option<(u64, Option<u64>)> = None;

    for bit in (0..u64::from(block_count) * 2).step_by(2) {
        let index = bit / 64;
        let chunk = match cached {
            Some((cached_index, chunk)) if cached_index == index => chunk,
            _ => {
                let chunk = match subsegment.read_element("BlockBitmap", index) {
                    Ok(chunk) => Some(chunk),
                    Err(e) => {
                        error!("subsegment 0x{base:x} bitmap chunk {index}: {e}");
                        None
                    }
                };
                cached = Some((index, chunk));
                chunk
            }
        };

        let remain = bit % 64;
        let bits = chunk.map(|chunk| {
            let byte = (chunk >> (8 * (remain / 8))) & 0xff;
            ((byte >> (8 - (remain % 8 + 2))) & 3) as u8
        });
        let address = base.wrapping_add(first).wrapping_add((bit / 2) * size);
        blocks.push(LfhBlockState { address, bits });
    }

    Ok(blocks)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfhBucket {
    pub address: u64,
    pub index: u64,
    pub total_block_count: u64,
    pub total_subsegment_count: u64,
    pub affinity_slot: u64,
    pub active_subsegment: Option<u64>,
    pub available: Vec<LfhSubsegment>,
    pub full: Vec<LfhSubsegment>,
}

impl LfhBucket {
    /// Decode the bucket at `bucket` through its first affinity slot
    pub fn read(bucket: TypedObject<'_>, index: u64, keys: &HeapKeys) -> Result<Self> {
        let address = bucket.address();
        let total_block_count = bucket.read("TotalBlockCount")?;
        let total_subsegment_count = bucket.read("TotalSubsegmentCount")?;

        let slots = bucket.read("AffinitySlots")?;
        let affinity_slot = bucket.target().read_pointer(slots)?;
        let slot = bucket.cast(LFH_AFFINITY_SLOT, affinity_slot);

        let active_subsegment = match slot.read("ActiveSubsegment") {
            Ok(active) => Some(active & !FAST_REF_MASK).filter(|a| *a != 0),
            Err(e) => {
                warn!("bucket {index} active subsegment: {e}");
                None
            }
        };

        let available = read_subsegments(slot, "State.AvailableSubsegmentList", keys)?;
        let full = read_subsegments(slot, "State.FullSubsegmentList", keys)?;

        Ok(Self {
            address,
            index,
            total_block_count,
            total_subsegment_count,
            affinity_slot,
            active_subsegment,
            available,
            full,
        })
    }

    pub fn subsegments(&self) -> impl Iterator<Item = &LfhSubsegment> {
        self.available.iter().chain(self.full.iter())
    }
}

fn read_subsegments(slot: TypedObject<'_>, list: &str, keys: &HeapKeys) -> Result<Vec<LfhSubsegment>> {
    let head = slot.field_address(list)?;
    let records = list_records(slot.target(), slot.layout(), head, LFH_SUBSEGMENT, "ListEntry")?;

    let mut subsegments = Vec::with_capacity(records.len());
    for record in records {
        match LfhSubsegment::read(slot.cast(LFH_SUBSEGMENT, record), keys) {
            Ok(subsegment) => subsegments.push(subsegment),
            Err(e) => error!("subsegment 0x{record:x}: {e}"),
        }
    }
    Ok(subsegments)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfhContext {
    pub address: u64,
    pub backend_ctx: u64,
    pub max_affinity: u8,
    pub max_block_size: u16,
    pub withhold_page_crossing_blocks: bool,
    pub disable_randomization: bool,
    pub buckets: Vec<LfhBucket>,
}

impl LfhContext {
    pub fn read(context: TypedObject<'_>, keys: &HeapKeys) -> Result<Self> {
        let address = context.address();
        let backend_ctx = context.read("BackendCtx")?;
        let max_affinity = context.read("MaxAffinity")? as u8;
        let max_block_size = context.read("Config.MaxBlockSize")? as u16;
        let withhold_page_crossing_blocks = context.read("Config.WitholdPageCrossingBlocks")? != 0;
        let disable_randomization = context.read("Config.DisableRandomization")? != 0;
        context.field_address("Buckets")?;

        let mut buckets = Vec::new();
        for index in 0..MAX_BUCKETS {
            let bucket = match context.read_element("Buckets", index) {
                Ok(bucket) => bucket,
                Err(e) => {
                    error!("lfh context 0x{address:x} bucket {index}: {e}");
                    continue;
                }
            };
            // unused buckets hold null or a tagged value with bit 0 set
            if bucket == 0 || bucket & 1 == 1 {
                continue;
            }
            match LfhBucket::read(context.cast(LFH_BUCKET, bucket), index, keys) {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => error!("bucket {index} at 0x{bucket:x}: {e}"),
            }
        }

        debug!("lfh context 0x{address:x}: {} active buckets", buckets.len());
        Ok(Self {
            address,
            backend_ctx,
            max_affinity,
            max_block_size,
            withhold_page_crossing_blocks,
            disable_randomization,
            buckets,
        })
    }

    pub fn randomization_enabled(&self) -> bool {
        !self.disable_randomization
    }
}
