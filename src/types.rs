//! Types that describe what is contained in a ZIP archive.

use std::fmt;
use std::sync::atomic::{self, Ordering};
use std::sync::{Arc, Weak};

use crate::compression::CompressionMethod;
use crate::extra_fields::ExtraField;
use crate::read::ArchiveInner;

/// System of origin encoded in the upper byte of `version made by`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum System {
    /// MS-DOS and OS/2
    Dos = 0,
    /// Unix
    Unix = 3,
    /// Any other host system
    Unknown,
}

impl System {
    pub(crate) fn from_u8(system: u8) -> System {
        use self::System::*;

        match system {
            0 => Dos,
            3 => Unix,
            _ => Unknown,
        }
    }
}

/// Wrapper for `u64` that is cheap to clone and mutable behind a shared
/// reference, used for metadata that is resolved lazily.
#[derive(Debug, Default)]
pub(crate) struct AtomicU64(atomic::AtomicU64);

impl AtomicU64 {
    pub fn new(v: u64) -> Self {
        Self(atomic::AtomicU64::new(v))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn store(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed)
    }
}

impl Clone for AtomicU64 {
    fn clone(&self) -> Self {
        Self(atomic::AtomicU64::new(self.load()))
    }
}

/// An uncompressed size that may still be a Mac-truncated value.
///
/// Shared between the entry handed to the caller, the uncertainty
/// registry in the archive state, and the stream-side size validator,
/// which enlarges it in place when inflation overflows the stored value.
#[derive(Debug)]
pub(crate) struct UncertainSize {
    size: atomic::AtomicU64,
    certain: atomic::AtomicBool,
}

impl UncertainSize {
    pub fn new(size: u64, certain: bool) -> Self {
        Self {
            size: atomic::AtomicU64::new(size),
            certain: atomic::AtomicBool::new(certain),
        }
    }

    pub fn get(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_certain(&self) -> bool {
        self.certain.load(Ordering::Relaxed)
    }

    pub fn mark_certain(&self) {
        self.certain.store(true, Ordering::Relaxed)
    }

    /// Grow by one 32-bit wraparound and return the new value.
    pub fn enlarge(&self) -> u64 {
        self.size.fetch_add(1 << 32, Ordering::Relaxed) + (1 << 32)
    }
}

/// Representation of a moment in time with the resolution of the
/// MS-DOS timestamps stored in ZIP archives (two-second granularity,
/// years 1980 through 2107).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
}

impl DateTime {
    /// Converts an msdos (u16, u16) pair to a DateTime object
    pub fn from_msdos(datepart: u16, timepart: u16) -> DateTime {
        let seconds = (timepart & 0b0000000000011111) << 1;
        let minutes = (timepart & 0b0000011111100000) >> 5;
        let hours = (timepart & 0b1111100000000000) >> 11;
        let days = datepart & 0b0000000000011111;
        let months = (datepart & 0b0000000111100000) >> 5;
        let years = (datepart & 0b1111111000000000) >> 9;

        DateTime {
            year: years + 1980,
            month: months as u8,
            day: days as u8,
            hour: hours as u8,
            minute: minutes as u8,
            second: seconds as u8,
        }
    }

    /// Converts the DateTime back to its msdos (datepart, timepart)
    /// representation. Seconds are truncated to two-second resolution.
    pub fn to_msdos(&self) -> (u16, u16) {
        let datepart =
            (self.year - 1980) << 9 | (self.month as u16) << 5 | self.day as u16;
        let timepart = (self.hour as u16) << 11
            | (self.minute as u16) << 5
            | (self.second as u16) >> 1;
        (datepart, timepart)
    }

    /// Get the year. There is no epoch, i.e. 2018 means exactly that.
    pub fn year(&self) -> u16 {
        self.year
    }

    /// Get the month, where 1 = january and 12 = december
    pub fn month(&self) -> u8 {
        self.month
    }

    /// Get the day
    pub fn day(&self) -> u8 {
        self.day
    }

    /// Get the hour
    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// Get the minute
    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// Get the second
    pub fn second(&self) -> u8 {
        self.second
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// One file, folder, or symlink record from the central directory.
///
/// Entries are produced by [`ZipArchive::read_entry`][crate::ZipArchive::read_entry]
/// and keep a non-owning back reference to their archive, through which
/// [`ZipEntry::open_read_stream`][crate::ZipArchive::open_read_stream]
/// resolves the file data.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub(crate) archive: Weak<ArchiveInner>,
    pub(crate) id: u64,
    pub(crate) file_name_raw: Vec<u8>,
    pub(crate) file_name: Option<String>,
    pub(crate) comment_raw: Vec<u8>,
    pub(crate) comment: Option<String>,
    pub(crate) version_made_by: u16,
    pub(crate) version_needed: u16,
    pub(crate) general_purpose_flags: u16,
    pub(crate) compression_method: CompressionMethod,
    pub(crate) last_mod_time: u16,
    pub(crate) last_mod_date: u16,
    pub(crate) crc32: u32,
    pub(crate) compressed_size: u64,
    pub(crate) uncompressed: Arc<UncertainSize>,
    pub(crate) internal_attributes: u16,
    pub(crate) external_attributes: u32,
    pub(crate) file_header_offset: u64,
    /// Start of the file data, resolved the first time a read stream
    /// validates the Local File Header. Zero means not yet resolved (file
    /// data can never start below offset 30).
    pub(crate) file_data_offset: AtomicU64,
    pub(crate) extra_fields: Vec<ExtraField>,
}

impl ZipEntry {
    /// Get the name of the entry, decoded per the archive's options.
    ///
    /// `None` when the archive was opened with `decode_strings` disabled;
    /// use [`ZipEntry::file_name_raw`] in that case.
    ///
    /// # Warnings
    ///
    /// It is dangerous to use this name directly when extracting an
    /// archive: unless the archive was opened with filename validation
    /// enabled (the default), it may contain an absolute path or break
    /// out of the current directory.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Get the name of the entry in the raw (internal) byte representation.
    pub fn file_name_raw(&self) -> &[u8] {
        &self.file_name_raw
    }

    /// Get the comment of the entry, when decoded.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Get the comment of the entry in the raw byte representation.
    pub fn comment_raw(&self) -> &[u8] {
        &self.comment_raw
    }

    /// Get the `version made by` field, including the host-system byte.
    pub fn version_made_by(&self) -> u16 {
        self.version_made_by
    }

    /// Get the minimum version needed to extract, as stored.
    pub fn version_needed(&self) -> u16 {
        self.version_needed
    }

    /// Get the general purpose bit flags.
    pub fn general_purpose_flags(&self) -> u16 {
        self.general_purpose_flags
    }

    /// Get the compression method of the file data.
    pub fn compression_method(&self) -> CompressionMethod {
        self.compression_method
    }

    /// Get the CRC32 hash of the uncompressed data.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Size of the file data as stored in the archive.
    ///
    /// For entries of a Mac archive this is the recovered 64-bit size,
    /// not the truncated value from the central directory.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Size of the file once decompressed.
    ///
    /// May still grow for entries of a (possible) Mac archive; see
    /// [`ZipEntry::uncompressed_size_certain`].
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed.get()
    }

    /// Whether [`ZipEntry::uncompressed_size`] is confirmed, or might be
    /// a value truncated modulo 2^32 by the Mac Archive Utility.
    pub fn uncompressed_size_certain(&self) -> bool {
        self.uncompressed.is_certain()
    }

    /// Get the internal file attributes.
    pub fn internal_attributes(&self) -> u16 {
        self.internal_attributes
    }

    /// Get the external file attributes.
    pub fn external_attributes(&self) -> u32 {
        self.external_attributes
    }

    /// Offset of the entry's Local File Header from the start of the
    /// archive.
    pub fn file_header_offset(&self) -> u64 {
        self.file_header_offset
    }

    /// Offset of the entry's file data, once a read stream has validated
    /// the Local File Header; `None` before that.
    pub fn file_data_offset(&self) -> Option<u64> {
        match self.file_data_offset.load() {
            0 => None,
            offset => Some(offset),
        }
    }

    /// The entry's extra fields in central directory order.
    pub fn extra_fields(&self) -> &[ExtraField] {
        &self.extra_fields
    }

    /// The raw MS-DOS modification date and time words.
    pub fn last_mod_msdos(&self) -> (u16, u16) {
        (self.last_mod_date, self.last_mod_time)
    }

    /// Get the last modification time as recorded in the archive.
    pub fn last_modified(&self) -> DateTime {
        DateTime::from_msdos(self.last_mod_date, self.last_mod_time)
    }

    /// Whether the file data is encrypted (general purpose bit 0).
    pub fn is_encrypted(&self) -> bool {
        self.general_purpose_flags & 1 == 1
    }

    /// Whether the file data is compressed.
    pub fn is_compressed(&self) -> bool {
        self.compression_method != CompressionMethod::Stored
    }

    /// Whether the entry names a directory.
    pub fn is_dir(&self) -> bool {
        self.file_name_raw.last() == Some(&b'/')
    }

    /// System of origin from the `version made by` field.
    pub fn system(&self) -> System {
        System::from_u8((self.version_made_by >> 8) as u8)
    }

    /// Get unix mode for the entry, when the external attributes carry one.
    pub fn unix_mode(&self) -> Option<u32> {
        if self.external_attributes == 0 {
            return None;
        }

        match self.system() {
            System::Unix => Some(self.external_attributes >> 16),
            System::Dos => {
                // Interpret the DOS directory and read-only bits
                let mut mode = if 0x10 == (self.external_attributes & 0x10) {
                    0o0040777
                } else {
                    0o0100666
                };
                if 0x01 == (self.external_attributes & 0x01) {
                    mode &= 0o0777555;
                }
                Some(mode)
            }
            _ => None,
        }
    }
}
