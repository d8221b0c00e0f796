use thiserror::Error;

use crate::memory::Width;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {width} at address 0x{address:x}")]
    UnreadableMemory { address: u64, width: Width },

    #[error("invalid {structure}.Signature at 0x{address:x}: 0x{found:x} (expected: 0x{expected:x})")]
    InvalidSignature { structure: &'static str, address: u64, found: u64, expected: u64 },

    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    #[error("unknown global {module}!{symbol}")]
    UnknownGlobal { module: String, symbol: String },

    #[error("layout has no entry for {structure}.{field}")]
    UnknownField { structure: String, field: String },

    #[error("invalid layout line {line}: {reason}")]
    InvalidLayout { line: usize, reason: String },

    #[error("malformed list at 0x{head:x}: {reason}")]
    MalformedList { head: u64, reason: String },

    #[error("malformed tree at 0x{root:x}: {reason}")]
    MalformedTree { root: u64, reason: String },

    #[error("region at 0x{address:x} overlaps an existing region")]
    OverlappingRegion { address: u64 },

    #[error("region at 0x{address:x} of 0x{len:x} bytes runs past the end of the address space")]
    RegionOutOfRange { address: u64, len: u64 },

    #[error("decode error: {0}")]
    Decode(#[from] deku::DekuError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
