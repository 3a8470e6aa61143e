//! Possible ZIP compression methods.

use std::fmt;

/// Compression methods for the contents of a ZIP file.
///
/// Only `Stored` and `Deflated` entries can be streamed; every other
/// method is carried through as `Unsupported` so callers can still list
/// the entry and inspect its metadata.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompressionMethod {
    /// The file is stored (no compression)
    Stored,
    /// The file is Deflated
    Deflated,
    /// Unsupported compression method
    Unsupported(u16),
}

impl CompressionMethod {
    /// Converts a u16 from the wire format to its corresponding CompressionMethod
    pub const fn from_u16(val: u16) -> CompressionMethod {
        match val {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflated,
            v => CompressionMethod::Unsupported(v),
        }
    }

    /// Converts a CompressionMethod to a u16 as it appears on the wire
    pub const fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflated => 8,
            CompressionMethod::Unsupported(v) => v,
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Just duplicate what the Debug format looks like
        write!(f, "{self:?}")
    }
}
