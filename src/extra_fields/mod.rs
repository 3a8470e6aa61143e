//! Parsing of the extra-field area attached to central directory entries.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

/// Header id of the ZIP64 extended information extra field.
pub const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;
/// Header id of the Info-ZIP Unicode Path extra field.
pub const UNICODE_PATH_EXTRA_FIELD_ID: u16 = 0x7075;
/// Header id of the field the Mac OS Archive Utility attaches to every
/// entry that is not a symlink. Its data is always 8 bytes.
pub const MAC_EXTRA_FIELD_ID: u16 = 22613;

/// The sentinel a 32-bit size or offset field holds when the real value
/// lives in the ZIP64 extended information extra field.
pub(crate) const ZIP64_BYTES_THR: u64 = u32::MAX as u64;
/// The sentinel the 16-bit entry count holds in a ZIP64 archive.
pub(crate) const ZIP64_ENTRY_THR: u64 = u16::MAX as u64;

/// One tagged blob from an entry's extra-field area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraField {
    /// Header id
    pub id: u16,
    /// Raw field data, without the id/length prefix
    pub data: Vec<u8>,
}

/// Split an extra-field area into its `(id, data)` blobs.
///
/// A truncated trailing field is dropped rather than rejected; real
/// archives carry plenty of malformed extra data that must not prevent
/// reading the entry.
pub(crate) fn parse_extra_fields(area: &[u8]) -> Vec<ExtraField> {
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos + 4 <= area.len() {
        let id = u16::from_le_bytes([area[pos], area[pos + 1]]);
        let len = u16::from_le_bytes([area[pos + 2], area[pos + 3]]) as usize;
        pos += 4;
        if pos + len > area.len() {
            break;
        }
        fields.push(ExtraField {
            id,
            data: area[pos..pos + len].to_vec(),
        });
        pos += len;
    }

    fields
}

/// Replace 32-bit sentinel values with their 64-bit counterparts from a
/// ZIP64 extended information extra field.
///
/// The field stores only the values whose 32-bit counterparts are
/// saturated, in the fixed order uncompressed size, compressed size,
/// header offset. Some writers omit values the format says must be
/// present; a field that runs short leaves the remaining sentinels
/// untouched instead of failing.
pub(crate) fn apply_zip64_extra_field(
    field: &ExtraField,
    uncompressed_size: &mut u64,
    compressed_size: &mut u64,
    header_offset: &mut u64,
) {
    debug_assert_eq!(field.id, ZIP64_EXTRA_FIELD_ID);
    let mut reader = Cursor::new(&field.data[..]);

    for value in [uncompressed_size, compressed_size, header_offset] {
        if *value != ZIP64_BYTES_THR {
            continue;
        }
        match reader.read_u64::<LittleEndian>() {
            Ok(v) => *value = v,
            Err(_) => break,
        }
    }
}

/// Extract the UTF-8 name from an Info-ZIP Unicode Path extra field.
///
/// The field only overrides the header name when its version byte is 1
/// and its CRC32 of the raw header name matches, proving the field was
/// written for this very name and not left over from an edit.
pub(crate) fn unicode_path(fields: &[ExtraField], file_name_raw: &[u8]) -> Option<String> {
    let field = fields
        .iter()
        .find(|f| f.id == UNICODE_PATH_EXTRA_FIELD_ID)?;
    let mut reader = Cursor::new(&field.data[..]);

    let version = reader.read_u8().ok()?;
    if version != 1 {
        return None;
    }
    let name_crc32 = reader.read_u32::<LittleEndian>().ok()?;
    if name_crc32 != crc32fast::hash(file_name_raw) {
        return None;
    }

    let mut utf8_name = Vec::new();
    reader.read_to_end(&mut utf8_name).ok()?;
    String::from_utf8(utf8_name).ok()
}
