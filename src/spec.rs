//! Wire-format records of the ZIP specification.
//!
//! Everything here decodes little-endian structures out of byte buffers
//! that were fetched through an [`ArchiveReader`]; nothing in this module
//! owns a cursor into the underlying source. The interesting part is
//! [`find_footer`], which locates the End of Central Directory Record by
//! scanning backward through the archive tail and resolves the optional
//! ZIP64 records behind it.

use std::cmp;
use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt};
use log::trace;

use crate::extra_fields::{
    self, ExtraField, ZIP64_BYTES_THR, ZIP64_ENTRY_THR, ZIP64_EXTRA_FIELD_ID,
};
use crate::reader::ArchiveReader;
use crate::result::{unsupported_zip_error, ZipError, ZipResult};

pub(crate) const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;
pub(crate) const CENTRAL_DIRECTORY_HEADER_SIGNATURE: u32 = 0x02014b50;
pub(crate) const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
pub(crate) const ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06064b50;
pub(crate) const ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE: u32 = 0x07064b50;
pub(crate) const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;

/// Fixed part of the End of Central Directory Record.
pub(crate) const EOCDR_LENGTH: u64 = 22;
/// Length of the ZIP64 End of Central Directory Locator.
pub(crate) const ZIP64_EOCDL_LENGTH: u64 = 20;
/// Fixed part of the ZIP64 End of Central Directory Record.
pub(crate) const ZIP64_EOCDR_LENGTH: u64 = 56;
/// Fixed part of a Central Directory File Header.
pub(crate) const CDH_LENGTH: u64 = 46;
/// Fixed part of a Local File Header.
pub(crate) const LFH_LENGTH: u64 = 30;
/// A Data Descriptor with its signature.
pub(crate) const DATA_DESCRIPTOR_LENGTH: u64 = 16;
/// Largest possible trailing archive comment.
pub(crate) const MAX_COMMENT_LENGTH: u64 = u16::MAX as u64;

fn eof_error() -> ZipError {
    ZipError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Unexpected end of file",
    ))
}

/// End of Central Directory Record.
#[derive(Debug)]
pub(crate) struct CentralDirectoryEnd {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entry_count: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub comment: Vec<u8>,
}

impl CentralDirectoryEnd {
    fn parse(buf: &[u8]) -> ZipResult<CentralDirectoryEnd> {
        let mut reader = Cursor::new(buf);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != CENTRAL_DIRECTORY_END_SIGNATURE {
            return Err(ZipError::InvalidArchive(
                "Invalid End of Central Directory Record signature",
            ));
        }
        let disk_number = reader.read_u16::<LittleEndian>()?;
        let disk_with_central_directory = reader.read_u16::<LittleEndian>()?;
        let _entries_on_this_disk = reader.read_u16::<LittleEndian>()?;
        let entry_count = reader.read_u16::<LittleEndian>()?;
        let central_directory_size = reader.read_u32::<LittleEndian>()?;
        let central_directory_offset = reader.read_u32::<LittleEndian>()?;
        let comment_length = reader.read_u16::<LittleEndian>()? as usize;
        let start = reader.position() as usize;
        if buf.len() < start + comment_length {
            return Err(eof_error());
        }
        let comment = buf[start..start + comment_length].to_vec();

        Ok(CentralDirectoryEnd {
            disk_number,
            disk_with_central_directory,
            entry_count,
            central_directory_size,
            central_directory_offset,
            comment,
        })
    }

    /// Scan `tail` backward for the record signature.
    ///
    /// The EOCDR carries a variable-length trailing comment, and that
    /// comment can itself contain the signature bytes. A candidate at
    /// position `p` is only accepted when its comment-length field agrees
    /// with the number of bytes that actually follow it, which rules out
    /// signatures embedded in a longer record's comment.
    fn find_and_parse(tail: &[u8]) -> ZipResult<(usize, CentralDirectoryEnd)> {
        if (tail.len() as u64) < EOCDR_LENGTH {
            return Err(ZipError::InvalidArchive(
                "End of Central Directory Record not found",
            ));
        }

        let latest = tail.len() - EOCDR_LENGTH as usize;
        for pos in (0..=latest).rev() {
            if tail[pos..pos + 4] != CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes() {
                continue;
            }
            let comment_length =
                u16::from_le_bytes([tail[pos + 20], tail[pos + 21]]) as usize;
            if tail.len() - pos - EOCDR_LENGTH as usize == comment_length {
                trace!("EOCDR candidate accepted at tail offset {pos}");
                return Ok((pos, CentralDirectoryEnd::parse(&tail[pos..])?));
            }
            trace!("EOCDR candidate at tail offset {pos} has a bad comment length");
        }

        Err(ZipError::InvalidArchive(
            "End of Central Directory Record not found",
        ))
    }
}

#[derive(Debug)]
pub(crate) struct Zip64CentralDirectoryEndLocator {
    pub disk_with_central_directory: u32,
    pub end_of_central_directory_offset: u64,
    pub number_of_disks: u32,
}

impl Zip64CentralDirectoryEndLocator {
    pub fn parse(buf: &[u8]) -> ZipResult<Zip64CentralDirectoryEndLocator> {
        let mut reader = Cursor::new(buf);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE {
            return Err(ZipError::InvalidArchive(
                "Invalid ZIP64 End of Central Directory Locator signature",
            ));
        }
        let disk_with_central_directory = reader.read_u32::<LittleEndian>()?;
        let end_of_central_directory_offset = reader.read_u64::<LittleEndian>()?;
        let number_of_disks = reader.read_u32::<LittleEndian>()?;

        Ok(Zip64CentralDirectoryEndLocator {
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
        })
    }

    pub fn has_signature(buf: &[u8]) -> bool {
        buf.len() >= 4 && buf[..4] == ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE.to_le_bytes()
    }
}

#[derive(Debug)]
pub(crate) struct Zip64CentralDirectoryEnd {
    pub size_of_record: u64,
    pub version_made_by: u16,
    pub version_needed_to_extract: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entry_count: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64CentralDirectoryEnd {
    pub fn parse(buf: &[u8]) -> ZipResult<Zip64CentralDirectoryEnd> {
        let mut reader = Cursor::new(buf);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE {
            return Err(ZipError::InvalidArchive(
                "Invalid ZIP64 End of Central Directory Record signature",
            ));
        }
        let size_of_record = reader.read_u64::<LittleEndian>()?;
        let version_made_by = reader.read_u16::<LittleEndian>()?;
        let version_needed_to_extract = reader.read_u16::<LittleEndian>()?;
        let disk_number = reader.read_u32::<LittleEndian>()?;
        let disk_with_central_directory = reader.read_u32::<LittleEndian>()?;
        let _entries_on_this_disk = reader.read_u64::<LittleEndian>()?;
        let entry_count = reader.read_u64::<LittleEndian>()?;
        let central_directory_size = reader.read_u64::<LittleEndian>()?;
        let central_directory_offset = reader.read_u64::<LittleEndian>()?;

        Ok(Zip64CentralDirectoryEnd {
            size_of_record,
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            entry_count,
            central_directory_size,
            central_directory_offset,
        })
    }

    /// Total bytes the record occupies, including signature and the
    /// size-of-record field itself.
    pub fn total_length(&self) -> u64 {
        self.size_of_record + 12
    }
}

/// Fixed part of a Central Directory File Header, fields still in their
/// 32-bit wire representation.
#[derive(Debug, Clone)]
pub(crate) struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub general_purpose_flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number_start: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub header_offset: u32,
}

impl CentralDirectoryHeader {
    pub fn parse(buf: &[u8]) -> ZipResult<CentralDirectoryHeader> {
        let mut reader = Cursor::new(buf);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != CENTRAL_DIRECTORY_HEADER_SIGNATURE {
            return Err(ZipError::InvalidArchive(
                "Invalid Central Directory File Header signature",
            ));
        }
        Ok(CentralDirectoryHeader {
            version_made_by: reader.read_u16::<LittleEndian>()?,
            version_needed: reader.read_u16::<LittleEndian>()?,
            general_purpose_flags: reader.read_u16::<LittleEndian>()?,
            compression_method: reader.read_u16::<LittleEndian>()?,
            last_mod_time: reader.read_u16::<LittleEndian>()?,
            last_mod_date: reader.read_u16::<LittleEndian>()?,
            crc32: reader.read_u32::<LittleEndian>()?,
            compressed_size: reader.read_u32::<LittleEndian>()?,
            uncompressed_size: reader.read_u32::<LittleEndian>()?,
            file_name_length: reader.read_u16::<LittleEndian>()?,
            extra_field_length: reader.read_u16::<LittleEndian>()?,
            file_comment_length: reader.read_u16::<LittleEndian>()?,
            disk_number_start: reader.read_u16::<LittleEndian>()?,
            internal_attributes: reader.read_u16::<LittleEndian>()?,
            external_attributes: reader.read_u32::<LittleEndian>()?,
            header_offset: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn variable_length(&self) -> u64 {
        self.file_name_length as u64
            + self.extra_field_length as u64
            + self.file_comment_length as u64
    }
}

/// Fixed part of a Local File Header.
#[derive(Debug)]
pub(crate) struct LocalFileHeader {
    pub version_needed: u16,
    pub general_purpose_flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    pub fn parse(buf: &[u8]) -> ZipResult<LocalFileHeader> {
        let mut reader = Cursor::new(buf);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(ZipError::InvalidArchive(
                "Invalid Local File Header signature",
            ));
        }
        Ok(LocalFileHeader {
            version_needed: reader.read_u16::<LittleEndian>()?,
            general_purpose_flags: reader.read_u16::<LittleEndian>()?,
            compression_method: reader.read_u16::<LittleEndian>()?,
            last_mod_time: reader.read_u16::<LittleEndian>()?,
            last_mod_date: reader.read_u16::<LittleEndian>()?,
            crc32: reader.read_u32::<LittleEndian>()?,
            compressed_size: reader.read_u32::<LittleEndian>()?,
            uncompressed_size: reader.read_u32::<LittleEndian>()?,
            file_name_length: reader.read_u16::<LittleEndian>()?,
            extra_field_length: reader.read_u16::<LittleEndian>()?,
        })
    }
}

/// The 16-byte Data Descriptor trailing an entry's file data.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

impl DataDescriptor {
    /// Decode `buf` as a descriptor, or `None` when the signature does
    /// not match. Used by the displaced-descriptor search, where a
    /// mismatch is an expected outcome rather than an error.
    pub fn parse(buf: &[u8]) -> Option<DataDescriptor> {
        if buf.len() < DATA_DESCRIPTOR_LENGTH as usize {
            return None;
        }
        let mut reader = Cursor::new(buf);
        if reader.read_u32::<LittleEndian>().ok()? != DATA_DESCRIPTOR_SIGNATURE {
            return None;
        }
        Some(DataDescriptor {
            crc32: reader.read_u32::<LittleEndian>().ok()?,
            compressed_size: reader.read_u32::<LittleEndian>().ok()?,
            uncompressed_size: reader.read_u32::<LittleEndian>().ok()?,
        })
    }
}

/// What the archive tail claims about the central directory, after the
/// ZIP64 records (when present) have been resolved.
#[derive(Debug)]
pub(crate) struct Footer {
    /// Start of the footer region: the EOCDR, or the ZIP64 EOCDR/EOCDL
    /// when those directly precede it.
    pub footer_offset: u64,
    pub entry_count: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
    pub is_zip64: bool,
    pub comment: Vec<u8>,
    /// A ZIP64 sentinel was present but the EOCDL was not. Tolerated
    /// with Mac support enabled, because the Archive Utility writes
    /// `entry_count == 65535` without any ZIP64 records.
    pub missing_zip64_locator: bool,
}

/// Locate and decode the archive footer.
pub(crate) async fn find_footer(
    reader: &ArchiveReader,
    support_mac_archive: bool,
) -> ZipResult<Footer> {
    let size = reader.size();
    if size < EOCDR_LENGTH {
        return Err(ZipError::InvalidArchive(
            "End of Central Directory Record not found",
        ));
    }

    let tail_length = cmp::min(size, EOCDR_LENGTH + MAX_COMMENT_LENGTH);
    let tail_start = size - tail_length;
    let tail = reader.read_exact_at(tail_start, tail_length as usize).await?;
    let (pos, eocdr) = CentralDirectoryEnd::find_and_parse(&tail)?;
    let eocdr_offset = tail_start + pos as u64;

    if eocdr.disk_number != 0 || eocdr.disk_with_central_directory != 0 {
        return unsupported_zip_error("Multi-disk archives are not supported");
    }

    let mut entry_count = eocdr.entry_count as u64;
    let mut central_directory_size = eocdr.central_directory_size as u64;
    let mut central_directory_offset = eocdr.central_directory_offset as u64;
    let mut footer_offset = eocdr_offset;
    let mut is_zip64 = entry_count == ZIP64_ENTRY_THR
        || central_directory_size == ZIP64_BYTES_THR
        || central_directory_offset == ZIP64_BYTES_THR;
    let mut missing_zip64_locator = false;

    if is_zip64 {
        let locator_present = eocdr_offset >= ZIP64_EOCDL_LENGTH && {
            let buf = reader
                .read_exact_at(eocdr_offset - ZIP64_EOCDL_LENGTH, 4)
                .await?;
            Zip64CentralDirectoryEndLocator::has_signature(&buf)
        };

        if !locator_present {
            // The Archive Utility truncates entry counts to 65535 without
            // writing any ZIP64 records, which looks like a ZIP64 archive
            // with its locator ripped out.
            if !support_mac_archive || !eocdr.comment.is_empty() {
                return Err(ZipError::InvalidArchive(
                    "Invalid ZIP64 End of Central Directory Locator signature",
                ));
            }
            is_zip64 = false;
            missing_zip64_locator = true;
        } else {
            let locator_offset = eocdr_offset - ZIP64_EOCDL_LENGTH;
            let buf = reader
                .read_exact_at(locator_offset, ZIP64_EOCDL_LENGTH as usize)
                .await?;
            let locator = Zip64CentralDirectoryEndLocator::parse(&buf)?;
            if locator.number_of_disks > 1 {
                return unsupported_zip_error("Multi-disk archives are not supported");
            }

            let record_offset = locator.end_of_central_directory_offset;
            if record_offset + ZIP64_EOCDR_LENGTH > locator_offset {
                return Err(ZipError::InvalidArchive(
                    "Invalid ZIP64 End of Central Directory Record offset",
                ));
            }
            let buf = reader
                .read_exact_at(record_offset, ZIP64_EOCDR_LENGTH as usize)
                .await?;
            let record = Zip64CentralDirectoryEnd::parse(&buf)?;
            if record.disk_number != 0 || record.disk_with_central_directory != 0 {
                return unsupported_zip_error("Multi-disk archives are not supported");
            }

            if entry_count == ZIP64_ENTRY_THR {
                entry_count = record.entry_count;
            }
            if central_directory_size == ZIP64_BYTES_THR {
                central_directory_size = record.central_directory_size;
            }
            if central_directory_offset == ZIP64_BYTES_THR {
                central_directory_offset = record.central_directory_offset;
            }

            // The footer starts wherever the trailing records begin as a
            // contiguous run; a gap between the ZIP64 EOCDR and the
            // locator leaves the record outside the footer region.
            footer_offset = if record_offset + record.total_length() == locator_offset {
                record_offset
            } else {
                locator_offset
            };
        }
    }

    Ok(Footer {
        footer_offset,
        entry_count,
        central_directory_size,
        central_directory_offset,
        is_zip64,
        comment: eocdr.comment,
        missing_zip64_locator,
    })
}

/// One Central Directory File Header with its variable-length parts,
/// ZIP64 values already applied.
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub header: CentralDirectoryHeader,
    pub file_name_raw: Vec<u8>,
    pub comment_raw: Vec<u8>,
    pub extra_fields: Vec<ExtraField>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub header_offset: u64,
}

impl RawEntry {
    /// Bytes this header occupies in the central directory.
    pub fn total_length(&self) -> u64 {
        CDH_LENGTH + self.header.variable_length()
    }

    /// Whether the entry carries a ZIP64 extended information field.
    pub fn has_zip64_field(&self) -> bool {
        self.extra_fields
            .iter()
            .any(|f| f.id == ZIP64_EXTRA_FIELD_ID)
    }
}

/// Read the Central Directory File Header at `offset`, bounded by `limit`
/// (the first byte past the central directory).
pub(crate) async fn read_raw_entry(
    reader: &ArchiveReader,
    offset: u64,
    limit: u64,
) -> ZipResult<RawEntry> {
    if offset + CDH_LENGTH > limit {
        return Err(eof_error());
    }
    let fixed = reader.read_exact_at(offset, CDH_LENGTH as usize).await?;
    let header = CentralDirectoryHeader::parse(&fixed)?;

    let variable_length = header.variable_length();
    if offset + CDH_LENGTH + variable_length > limit {
        return Err(eof_error());
    }
    let variable = reader
        .read_exact_at(offset + CDH_LENGTH, variable_length as usize)
        .await?;

    let name_end = header.file_name_length as usize;
    let extra_end = name_end + header.extra_field_length as usize;
    let file_name_raw = variable[..name_end].to_vec();
    let extra_fields = extra_fields::parse_extra_fields(&variable[name_end..extra_end]);
    let comment_raw = variable[extra_end..].to_vec();

    let mut uncompressed_size = header.uncompressed_size as u64;
    let mut compressed_size = header.compressed_size as u64;
    let mut header_offset = header.header_offset as u64;
    if let Some(field) = extra_fields
        .iter()
        .find(|f| f.id == ZIP64_EXTRA_FIELD_ID)
    {
        extra_fields::apply_zip64_extra_field(
            field,
            &mut uncompressed_size,
            &mut compressed_size,
            &mut header_offset,
        );
    }

    Ok(RawEntry {
        header,
        file_name_raw,
        comment_raw,
        extra_fields,
        uncompressed_size,
        compressed_size,
        header_offset,
    })
}
