use log::{debug, error};

use crate::error::{Error, Result};
use crate::layout::{SEG_CONTEXT, SEGMENT_HEAP, TypedObject};
use crate::segment::SegContext;

/// `_SEGMENT_HEAP.Signature` of every segment heap
pub const SEGMENT_HEAP_SIGNATURE: u64 = 0xddeeddee;

/// Number of entries in `_SEGMENT_HEAP.SegContexts`
pub const SEG_CONTEXTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeap {
    pub address: u64,
    pub signature: u64,
    pub global_flags: u32,
    /// Indexed as in `SegContexts`, `None` where the context could not be decoded
    pub seg_contexts: [Option<SegContext>; SEG_CONTEXTS],
    /// Address of the embedded `_HEAP_LFH_CONTEXT`
    pub lfh_context: u64,
    /// Address of the embedded `_HEAP_VS_CONTEXT`
    pub vs_context: u64,
}

impl SegmentHeap {
    /// Decode the heap header at `heap`.
    ///
    /// Fails with [`Error::InvalidSignature`] before reading anything else when the
    /// signature does not match.
    pub fn read(heap: TypedObject<'_>) -> Result<Self> {
        let address = heap.address();
        let signature = heap.read("Signature")?;
        if signature != SEGMENT_HEAP_SIGNATURE {
            return Err(Error::InvalidSignature {
                structure: SEGMENT_HEAP,
                address,
                found: signature,
                expected: SEGMENT_HEAP_SIGNATURE,
            });
        }

        let global_flags = heap.read("GlobalFlags")? as u32;
        let lfh_context = heap.field_address("LfhContext")?;
        let vs_context = heap.field_address("VsContext")?;

        let mut seg_contexts: [Option<SegContext>; SEG_CONTEXTS] = Default::default();
        for (index, slot) in seg_contexts.iter_mut().enumerate() {
            let context = heap.element("SegContexts", SEG_CONTEXT, index as u64)?;
            match SegContext::read(context) {
                Ok(context) => *slot = Some(context),
                Err(e) => error!("seg context {index} at 0x{:x}: {e}", context.address()),
            }
        }

        debug!("segment heap 0x{address:x}: flags 0x{global_flags:x}");
        Ok(Self { address, signature, global_flags, seg_contexts, lfh_context, vs_context })
    }
}
