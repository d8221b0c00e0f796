//! Heap cookie decoding.
//!
//! The allocator XORs LFH block offsets and VS chunk headers with secrets kept in
//! `nt!RtlpHpHeapGlobals`, mixed with the address of the protected structure. The keys
//! are loaded once per dump and passed explicitly to every decoder.

use deku::prelude::*;
use log::debug;

use crate::error::Result;
use crate::layout::{HEAP_GLOBALS, Layout};
use crate::memory::Target;

pub const HEAP_GLOBALS_MODULE: &str = "nt";
pub const HEAP_GLOBALS_SYMBOL: &str = "RtlpHpHeapGlobals";

/// VS sizes are stored in 16 byte units
pub const VS_UNIT_SIZE: u64 = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapKeys {
    pub heap_key: u64,
    pub lfh_key: u32,
}

impl HeapKeys {
    /// Read the keys from `nt!RtlpHpHeapGlobals` of `target`
    pub fn load(target: &dyn Target, layout: &Layout) -> Result<Self> {
        let address = target.resolve_global(HEAP_GLOBALS_MODULE, HEAP_GLOBALS_SYMBOL)?;
        let globals = layout.object(target, HEAP_GLOBALS, address);
        let heap_key = globals.read("HeapKey")?;
        let lfh_key = globals.read("LfhKey")? as u32;
        debug!("heap keys from 0x{address:x}: heap_key=0x{heap_key:x} lfh_key=0x{lfh_key:x}");
        Ok(Self { heap_key, lfh_key })
    }
}

fn lfh_salt(lfh_key: u32, subsegment: u64) -> u32 {
    lfh_key ^ ((subsegment & 0xffff_ffff) >> 12) as u32
}

/// `_HEAP_LFH_SUBSEGMENT_ENCODED_OFFSETS` in the clear
#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct LfhBlockOffsets {
    pub block_size: u16,
    pub first_block_offset: u16,
}

impl LfhBlockOffsets {
    pub fn decode(
        lfh_key: u32,
        subsegment: u64,
        raw_block_size: u16,
        raw_first_block_offset: u16,
    ) -> Result<Self> {
        let encoded = u32::from(raw_block_size) | (u32::from(raw_first_block_offset) << 16);
        let decoded = encoded ^ lfh_salt(lfh_key, subsegment);
        let bytes = decoded.to_le_bytes();
        let (_, offsets) = Self::from_bytes((&bytes[..], 0))?;
        Ok(offsets)
    }

    /// Inverse of [`LfhBlockOffsets::decode`], returns `(BlockSize, FirstBlockOffset)` as stored
    pub fn encode(&self, lfh_key: u32, subsegment: u64) -> Result<(u16, u16)> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.to_bytes()?);
        let encoded = u32::from_le_bytes(buf) ^ lfh_salt(lfh_key, subsegment);
        Ok((encoded as u16, (encoded >> 16) as u16))
    }
}

/// `_HEAP_VS_CHUNK_HEADER_SIZE` in the clear
#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VsChunkHeaderSize {
    pub memory_cost: u16,
    pub unsafe_size: u16,
    pub unsafe_prev_size: u16,
    pub allocated: u8,
    pub extra: u8,
}

impl VsChunkHeaderSize {
    /// Decode the qword stored at `header_address`
    pub fn decode(heap_key: u64, header_address: u64, raw: u64) -> Result<Self> {
        let bits = header_address ^ heap_key ^ raw;
        let bytes = bits.to_le_bytes();
        let (_, header) = Self::from_bytes((&bytes[..], 0))?;
        Ok(header)
    }

    /// Inverse of [`VsChunkHeaderSize::decode`]
    pub fn encode(&self, heap_key: u64, header_address: u64) -> Result<u64> {
        Ok(self.bits()? ^ heap_key ^ header_address)
    }

    /// The header as a plain qword
    pub fn bits(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.to_bytes()?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn size(&self) -> u64 {
        u64::from(self.unsafe_size) * VS_UNIT_SIZE
    }

    pub fn prev_size(&self) -> u64 {
        u64::from(self.unsafe_prev_size) * VS_UNIT_SIZE
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::Snapshot;
    use rstest::rstest;

    #[test]
    fn test_lfh_offsets_known_values() {
        // salt = 0xaabbccdd ^ (0x12000 >> 12)
        let subsegment = 0xffff_a001_0001_2000;
        let offsets = LfhBlockOffsets::decode(0xaabbccdd, subsegment, 0xccff, 0xaaab).unwrap();
        assert_eq!(offsets, LfhBlockOffsets { block_size: 0x30, first_block_offset: 0x10 });

        let stored = offsets.encode(0xaabbccdd, subsegment).unwrap();
        assert_eq!(stored, (0xccff, 0xaaab));
    }

    #[rstest]
    #[case(0x0000_0000, 0xffff_8000_0000_0000, 0x10, 0x40)]
    #[case(0xaabb_ccdd, 0xffff_a001_0001_2000, 0x30, 0x10)]
    #[case(0xffff_ffff, 0x0000_7ff6_ffff_f000, 0xfff0, 0xffff)]
    #[case(0x1234_5678, 0xffff_c30f_8a6b_1000, 0x1, 0x0)]
    fn test_lfh_offsets_round_trip(
        #[case] lfh_key: u32,
        #[case] subsegment: u64,
        #[case] block_size: u16,
        #[case] first_block_offset: u16,
    ) {
        let offsets = LfhBlockOffsets { block_size, first_block_offset };
        let (raw_size, raw_offset) = offsets.encode(lfh_key, subsegment).unwrap();
        let decoded = LfhBlockOffsets::decode(lfh_key, subsegment, raw_size, raw_offset).unwrap();
        assert_eq!(decoded, offsets);
    }

    #[test]
    fn test_lfh_offsets_depend_on_subsegment_address() {
        let offsets = LfhBlockOffsets { block_size: 0x30, first_block_offset: 0x10 };
        let a = offsets.encode(0xaabbccdd, 0xffff_a001_0001_2000).unwrap();
        let b = offsets.encode(0xaabbccdd, 0xffff_a001_0001_3000).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_vs_header_fields() {
        let heap_key = 0x1122_3344_5566_7788;
        let address = 0xffff_c000_0010_1000;
        let bits: u64 = 0x0001_0008_0011_0002;
        let header = VsChunkHeaderSize::decode(heap_key, address, bits ^ heap_key ^ address).unwrap();

        assert_eq!(header.memory_cost, 2);
        assert_eq!(header.size(), 0x11 * 16);
        assert_eq!(header.prev_size(), 0x8 * 16);
        assert!(header.is_allocated());
        assert_eq!(header.bits().unwrap(), bits);
    }

    #[rstest]
    #[case(0, 0x1000, 0x0, 0x0, 0)]
    #[case(0xdead_beef_0bad_f00d, 0xffff_8000_1234_5670, 0x20, 0x10, 0)]
    #[case(0x8000_0000_0000_0001, 0x0000_0200_0000_1000, 0xffff, 0xffff, 1)]
    fn test_vs_header_round_trip(
        #[case] heap_key: u64,
        #[case] address: u64,
        #[case] unsafe_size: u16,
        #[case] unsafe_prev_size: u16,
        #[case] allocated: u8,
    ) {
        let header =
            VsChunkHeaderSize { memory_cost: 0x7, unsafe_size, unsafe_prev_size, allocated, extra: 0 };
        let raw = header.encode(heap_key, address).unwrap();
        assert_eq!(VsChunkHeaderSize::decode(heap_key, address, raw).unwrap(), header);
    }

    #[test]
    fn test_load_keys() {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(0xfffff800_00c00000, 0x10).unwrap();
        snapshot.write_u64(0xfffff800_00c00000, 0x0123_4567_89ab_cdef).unwrap();
        snapshot.write_u32(0xfffff800_00c00008, 0xaabbccdd).unwrap();
        snapshot.add_global("nt", "RtlpHpHeapGlobals", 0xfffff800_00c00000);

        let keys = HeapKeys::load(&snapshot, Layout::nt_x64()).unwrap();
        assert_eq!(keys, HeapKeys { heap_key: 0x0123_4567_89ab_cdef, lfh_key: 0xaabbccdd });
    }

    #[test]
    fn test_load_keys_missing_global() {
        let snapshot = Snapshot::new();
        assert!(matches!(
            HeapKeys::load(&snapshot, Layout::nt_x64()),
            Err(Error::UnknownGlobal { .. })
        ));
    }
}
