use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use deku::ctx::Endian;
use log::{debug, trace};

use crate::error::{Error, Result};

/// Size of a single fixed-width read
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Width {
    pub const fn len(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }

    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            1 => Some(Width::Byte),
            2 => Some(Width::Word),
            4 => Some(Width::Dword),
            8 => Some(Width::Qword),
            _ => None,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Width::Byte => "byte",
            Width::Word => "word",
            Width::Dword => "dword",
            Width::Qword => "qword",
        };
        f.write_str(name)
    }
}

/// The debugging host as seen by the decoders.
///
/// Everything is read through this trait, so the same decoders work against a live
/// session, a crash dump, or a [`Snapshot`] assembled in a test.
pub trait Target {
    /// Read an unsigned integer of `width` bytes at `address`
    fn read(&self, address: u64, width: Width) -> Result<u64>;

    /// Resolve the address of `module!symbol`
    fn resolve_global(&self, module: &str, symbol: &str) -> Result<u64>;

    /// Pointer size of the target in bytes
    fn pointer_size(&self) -> u8;

    /// True if the target is a kernel session
    fn is_kernel(&self) -> bool;

    fn read_pointer(&self, address: u64) -> Result<u64> {
        self.read(address, Width::Qword)
    }
}

/// Raw memory regions mapped at virtual addresses, plus resolved globals
#[derive(Debug, Clone)]
pub struct Snapshot {
    regions: BTreeMap<u64, Vec<u8>>,
    globals: HashMap<String, u64>,
    endian: Endian,
    pointer_size: u8,
    kernel: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// Empty little-endian 64-bit kernel snapshot
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            globals: HashMap::new(),
            endian: Endian::Little,
            pointer_size: 8,
            kernel: true,
        }
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_pointer_size(mut self, pointer_size: u8) -> Self {
        self.pointer_size = pointer_size;
        self
    }

    pub fn with_kernel(mut self, kernel: bool) -> Self {
        self.kernel = kernel;
        self
    }

    /// Map `data` at `address`. Regions may not overlap.
    pub fn add_region(&mut self, address: u64, data: Vec<u8>) -> Result<()> {
        // u128 so a region may end exactly at the top of the address space
        let end = u128::from(address) + data.len() as u128;
        if end > 1 << 64 {
            return Err(Error::RegionOutOfRange { address, len: data.len() as u64 });
        }
        if let Some((start, prev)) = self.regions.range(..=address).next_back()
            && u128::from(*start) + prev.len() as u128 > u128::from(address)
        {
            return Err(Error::OverlappingRegion { address });
        }
        if let Some((start, _)) = self.regions.range(address..).next()
            && u128::from(*start) < end
        {
            return Err(Error::OverlappingRegion { address });
        }

        debug!("mapped region 0x{address:x}..0x{end:x}");
        self.regions.insert(address, data);
        Ok(())
    }

    /// Map `len` zeroed bytes at `address`
    pub fn add_zeroed(&mut self, address: u64, len: usize) -> Result<()> {
        self.add_region(address, vec![0; len])
    }

    /// Map the contents of the file at `path` at `address`
    pub fn load_region(&mut self, address: u64, path: impl AsRef<Path>) -> Result<()> {
        let data = std::fs::read(path.as_ref())?;
        debug!("loaded {} bytes from {}", data.len(), path.as_ref().display());
        self.add_region(address, data)
    }

    pub fn add_global(&mut self, module: &str, symbol: &str, address: u64) {
        self.globals.insert(format!("{module}!{symbol}"), address);
    }

    pub fn regions(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.regions.iter().map(|(start, data)| (*start, data.len()))
    }

    fn slice(&self, address: u64, len: usize) -> Option<&[u8]> {
        let (start, data) = self.regions.range(..=address).next_back()?;
        let offset = usize::try_from(address - start).ok()?;
        let end = offset.checked_add(len)?;
        data.get(offset..end)
    }

    fn slice_mut(&mut self, address: u64, len: usize) -> Option<&mut [u8]> {
        let (start, data) = self.regions.range_mut(..=address).next_back()?;
        let offset = usize::try_from(address - *start).ok()?;
        let end = offset.checked_add(len)?;
        data.get_mut(offset..end)
    }

    /// Store the low `width` bytes of `value` at `address`
    pub fn write(&mut self, address: u64, width: Width, value: u64) -> Result<()> {
        let endian = self.endian;
        let Some(dst) = self.slice_mut(address, width.len()) else {
            return Err(Error::UnreadableMemory { address, width });
        };
        match endian {
            Endian::Little => dst.copy_from_slice(&value.to_le_bytes()[..width.len()]),
            Endian::Big => dst.copy_from_slice(&value.to_be_bytes()[8 - width.len()..]),
        }
        Ok(())
    }

    pub fn write_u8(&mut self, address: u64, value: u8) -> Result<()> {
        self.write(address, Width::Byte, value.into())
    }

    pub fn write_u16(&mut self, address: u64, value: u16) -> Result<()> {
        self.write(address, Width::Word, value.into())
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<()> {
        self.write(address, Width::Dword, value.into())
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        self.write(address, Width::Qword, value)
    }
}

impl Target for Snapshot {
    fn read(&self, address: u64, width: Width) -> Result<u64> {
        let Some(src) = self.slice(address, width.len()) else {
            trace!("unmapped read of {width} at 0x{address:x}");
            return Err(Error::UnreadableMemory { address, width });
        };
        let mut buf = [0u8; 8];
        let value = match self.endian {
            Endian::Little => {
                buf[..src.len()].copy_from_slice(src);
                u64::from_le_bytes(buf)
            }
            Endian::Big => {
                buf[8 - src.len()..].copy_from_slice(src);
                u64::from_be_bytes(buf)
            }
        };
        Ok(value)
    }

    fn resolve_global(&self, module: &str, symbol: &str) -> Result<u64> {
        self.globals.get(&format!("{module}!{symbol}")).copied().ok_or_else(|| {
            Error::UnknownGlobal { module: module.to_owned(), symbol: symbol.to_owned() }
        })
    }

    fn pointer_size(&self) -> u8 {
        self.pointer_size
    }

    fn is_kernel(&self) -> bool {
        self.kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Width::Byte, 0x88)]
    #[case(Width::Word, 0x7788)]
    #[case(Width::Dword, 0x55667788)]
    #[case(Width::Qword, 0x1122334455667788)]
    fn test_read_little_endian(#[case] width: Width, #[case] expected: u64) {
        let mut snapshot = Snapshot::new();
        snapshot
            .add_region(0x1000, vec![0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11])
            .unwrap();
        assert_eq!(snapshot.read(0x1000, width).unwrap(), expected);
    }

    #[test]
    fn test_read_big_endian() {
        let mut snapshot = Snapshot::new().with_endian(Endian::Big);
        snapshot.add_region(0x1000, vec![0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(snapshot.read(0x1000, Width::Dword).unwrap(), 0x11223344);
        assert_eq!(snapshot.read(0x1002, Width::Word).unwrap(), 0x3344);

        snapshot.write_u16(0x1000, 0xabcd).unwrap();
        assert_eq!(snapshot.read(0x1000, Width::Dword).unwrap(), 0xabcd3344);
    }

    #[test]
    fn test_write_then_read() {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(0x2000, 0x20).unwrap();
        snapshot.write_u64(0x2008, 0xdeadbeefcafebabe).unwrap();
        snapshot.write_u8(0x2010, 0xff).unwrap();

        assert_eq!(snapshot.read_pointer(0x2008).unwrap(), 0xdeadbeefcafebabe);
        assert_eq!(snapshot.read(0x200c, Width::Dword).unwrap(), 0xdeadbeef);
        assert_eq!(snapshot.read(0x2010, Width::Word).unwrap(), 0xff);
    }

    #[rstest]
    #[case(0x0fff)]
    #[case(0x101d)]
    #[case(0x3000)]
    fn test_read_unmapped(#[case] address: u64) {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(0x1000, 0x20).unwrap();
        let err = snapshot.read(address, Width::Qword).unwrap_err();
        assert!(matches!(err, Error::UnreadableMemory { address: a, width: Width::Qword } if a == address));
    }

    #[test]
    fn test_read_does_not_span_regions() {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(0x1000, 0x10).unwrap();
        snapshot.add_zeroed(0x1010, 0x10).unwrap();
        assert!(snapshot.read(0x100c, Width::Qword).is_err());
        assert!(snapshot.read(0x1008, Width::Qword).is_ok());
    }

    #[rstest]
    #[case(0x0ff8, 0x10)]
    #[case(0x1008, 0x4)]
    #[case(0x1000, 0x1)]
    fn test_overlapping_region_rejected(#[case] address: u64, #[case] len: usize) {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(0x1000, 0x10).unwrap();
        assert!(matches!(
            snapshot.add_zeroed(address, len),
            Err(Error::OverlappingRegion { .. })
        ));
    }

    #[test]
    fn test_region_at_top_of_address_space() {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(0xffff_ffff_ffff_f000, 0x1000).unwrap();
        assert_eq!(snapshot.read(0xffff_ffff_ffff_fff8, Width::Qword).unwrap(), 0);
        assert!(matches!(
            snapshot.add_zeroed(0xffff_ffff_ffff_f800, 0x10),
            Err(Error::OverlappingRegion { address: 0xffff_ffff_ffff_f800 })
        ));
    }

    #[test]
    fn test_region_wrapping_rejected() {
        let mut snapshot = Snapshot::new();
        assert!(matches!(
            snapshot.add_zeroed(0xffff_ffff_ffff_f000, 0x2000),
            Err(Error::RegionOutOfRange { len: 0x2000, .. })
        ));
        assert_eq!(snapshot.regions().count(), 0);
    }

    #[test]
    fn test_resolve_global() {
        let mut snapshot = Snapshot::new();
        snapshot.add_global("nt", "RtlpHpHeapGlobals", 0xfffff80000001000);
        assert_eq!(snapshot.resolve_global("nt", "RtlpHpHeapGlobals").unwrap(), 0xfffff80000001000);
        assert!(matches!(
            snapshot.resolve_global("nt", "Missing"),
            Err(Error::UnknownGlobal { .. })
        ));
    }

    #[test]
    fn test_width_from_len() {
        assert_eq!(Width::from_len(4), Some(Width::Dword));
        assert_eq!(Width::from_len(3), None);
    }
}
