//! Decoder for the Windows kernel Segment Heap.
//!
//! Given a [`Target`] that can read memory and resolve globals, and a [`Layout`] giving
//! the structure offsets, the entry points below turn raw heap memory into typed records:
//! the segment heap header with its page segments, LFH buckets with per block state, and
//! the free chunk tree of the VS allocator. Encoded fields are decoded with the keys from
//! `nt!RtlpHpHeapGlobals`.

pub mod codec;
pub mod error;
pub mod heap;
pub mod layout;
pub mod lfh;
pub mod list;
pub mod memory;
pub mod segment;
pub mod vs;

#[cfg(test)]
mod testing;

use log::info;

pub use codec::{HeapKeys, LfhBlockOffsets, VsChunkHeaderSize};
pub use error::{Error, Result};
pub use heap::SegmentHeap;
pub use layout::{Field, Layout, TypedObject};
pub use lfh::{LfhBlockState, LfhBucket, LfhContext, LfhSubsegment, SubsegmentLocation};
pub use memory::{Snapshot, Target, Width};
pub use segment::{PageRangeDescriptor, PageSegment, RangeKind, SegContext};
pub use vs::{LockType, VsContext, VsChunkFreeHeader};

/// Only 64-bit kernel sessions are understood
pub fn check_target(target: &dyn Target) -> Result<()> {
    if target.pointer_size() != 8 {
        return Err(Error::UnsupportedTarget(format!(
            "{}-bit target, only 64-bit is supported",
            u32::from(target.pointer_size()) * 8
        )));
    }
    if !target.is_kernel() {
        return Err(Error::UnsupportedTarget("user mode target, only kernel is supported".to_owned()));
    }
    Ok(())
}

/// Decode the `_SEGMENT_HEAP` at `address`
pub fn segheap(target: &dyn Target, layout: &Layout, address: u64) -> Result<SegmentHeap> {
    check_target(target)?;
    info!("segment heap at 0x{address:x}");
    SegmentHeap::read(layout.object(target, layout::SEGMENT_HEAP, address))
}

/// Decode the `_HEAP_LFH_SUBSEGMENT` at `address` with the state of every block
pub fn lfhsub(target: &dyn Target, layout: &Layout, address: u64) -> Result<LfhSubsegment> {
    check_target(target)?;
    info!("lfh subsegment at 0x{address:x}");
    let keys = HeapKeys::load(target, layout)?;
    LfhSubsegment::read(layout.object(target, layout::LFH_SUBSEGMENT, address), &keys)
}

/// Decode the `_HEAP_LFH_CONTEXT` at `address` and every active bucket
pub fn lfhctx(target: &dyn Target, layout: &Layout, address: u64) -> Result<LfhContext> {
    check_target(target)?;
    info!("lfh context at 0x{address:x}");
    let keys = HeapKeys::load(target, layout)?;
    LfhContext::read(layout.object(target, layout::LFH_CONTEXT, address), &keys)
}

/// Decode the `_HEAP_VS_CONTEXT` at `address` and its free chunk tree
pub fn vsctx(target: &dyn Target, layout: &Layout, address: u64) -> Result<VsContext> {
    check_target(target)?;
    info!("vs context at 0x{address:x}");
    let keys = HeapKeys::load(target, layout)?;
    VsContext::read(layout.object(target, layout::VS_CONTEXT, address), &keys)
}
