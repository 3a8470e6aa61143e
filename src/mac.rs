//! Central directory anchoring and the Mac Archive Utility dialect.
//!
//! The ZIP specification says the End of Central Directory Record tells
//! the truth. The Mac OS Archive Utility frequently lies: past 4 GiB (or
//! 65535 entries) it keeps writing 32- and 16-bit fields, silently
//! truncated, instead of switching to ZIP64. This module reconciles what
//! the footer *claims* with what the physical layout *permits* and
//! converges on one of three verdicts:
//!
//! 1. spec-compliant: the claims are taken verbatim;
//! 2. maybe Mac: the layout is consistent with either reading, and later
//!    entries may settle it either way;
//! 3. definitely Mac: truncation was proven, and the true offsets, sizes
//!    and counts have been recovered.
//!
//! The verdict is monotone. Once an archive is definitely Mac it never
//! goes back, and once it is demoted to spec-compliant no later evidence
//! can make it Mac again; a spec-compliant archive is never mis-parsed
//! as Mac because every promotion requires evidence a compliant writer
//! cannot produce.

use std::cmp;
use std::io;
use std::mem;
use std::sync::Weak;

use indexmap::IndexMap;
use log::debug;
use parking_lot::Mutex;

use crate::extra_fields::MAC_EXTRA_FIELD_ID;
use crate::reader::ArchiveReader;
use crate::result::{ZipError, ZipResult};
use crate::spec::{self, Footer, RawEntry};
use crate::types::UncertainSize;

/// `version made by` of every Archive Utility entry (Unix, version 2.1).
pub(crate) const MAC_VERSION_MADE_BY: u16 = 789;
/// Longest central directory header the Archive Utility emits: the fixed
/// part, a maximal file name, and the single 12-byte extra field. It
/// never writes entry comments.
pub(crate) const CDH_MAX_LENGTH_MAC: u64 = 46 + 65535 + 12;
/// DEFLATE cannot expand its input by more than a factor of 1032.
pub(crate) const DEFLATE_MAX_EXPANSION: u64 = 1032;
pub(crate) const FOUR_GIB: u64 = 1 << 32;

/// What is known about the archive's dialect. The set of entries whose
/// uncompressed size is unconfirmed only exists while the question is
/// open; both resolutions drain it.
#[derive(Debug)]
pub(crate) enum MacState {
    /// Definitely not written by the Archive Utility (or Mac support is
    /// disabled). Every claim is final.
    SpecCompliant,
    /// Consistent with both dialects so far. Entries whose uncompressed
    /// size would change under the Mac reading are tracked here, keyed
    /// by entry id.
    Maybe {
        uncertain: IndexMap<u64, Weak<UncertainSize>>,
    },
    /// Proven to be an Archive Utility archive with recovered metadata.
    Definite,
}

impl MacState {
    pub fn is_definite(&self) -> bool {
        matches!(self, MacState::Definite)
    }

    pub fn is_maybe(&self) -> bool {
        matches!(self, MacState::Maybe { .. })
    }

    pub fn could_be_mac(&self) -> bool {
        !matches!(self, MacState::SpecCompliant)
    }
}

/// The mutable half of an archive: directory claims with their certainty
/// flags, the iteration cursors, and the Mac verdict.
#[derive(Debug)]
pub(crate) struct ArchiveState {
    pub cd_offset: u64,
    pub cd_size: u64,
    pub entry_count: u64,
    pub cd_offset_certain: bool,
    pub cd_size_certain: bool,
    pub entry_count_certain: bool,
    pub compressed_sizes_certain: bool,
    pub uncompressed_sizes_certain: bool,
    pub mac: MacState,
    /// Offset of the next Central Directory File Header.
    pub entry_cursor: u64,
    /// Offset where the next Local File Header must sit, tracked only
    /// while the archive may be Mac (truncated header offsets are
    /// recovered from it).
    pub file_cursor: Option<u64>,
    pub entries_read: u64,
    /// First header, cached by the anchor probe so iteration does not
    /// read it twice.
    pub first_entry: Option<RawEntry>,
    pub next_entry_id: u64,
}

impl ArchiveState {
    /// First byte past the central directory.
    pub fn cd_end(&self) -> u64 {
        self.cd_offset + self.cd_size
    }

    /// Promote to definitely-Mac and finalize the recoverable claims.
    ///
    /// Mac archives pack the central directory right up to the footer,
    /// so its size is now exact; the entry count is re-minimized against
    /// the space the remaining entries must fill. The uncertain-size
    /// registry is dropped without touching the entries: their sizes
    /// stay unconfirmed and the streaming validator enlarges them on
    /// overflow.
    pub fn set_as_mac_archive(&mut self, footer_offset: u64) {
        if self.mac.is_definite() {
            return;
        }
        debug!("archive is definitely a Mac OS Archive Utility ZIP");
        self.mac = MacState::Definite;
        self.cd_size = footer_offset - self.cd_offset;
        self.cd_size_certain = true;

        let remaining_space = footer_offset - self.entry_cursor;
        let mut remaining = self.entry_count - self.entries_read;
        while remaining * CDH_MAX_LENGTH_MAC < remaining_space {
            self.entry_count += 0x10000;
            remaining += 0x10000;
        }
        self.entry_count_certain = (remaining + 0x10000) * spec::CDH_LENGTH > remaining_space;
        self.uncompressed_sizes_certain = false;
        if self.file_cursor.is_none() {
            self.file_cursor = Some(0);
        }
    }

    /// Demote to spec-compliant: every claim becomes final and every
    /// still-live entry in the uncertain-size registry is confirmed.
    pub fn set_as_not_mac_archive(&mut self) {
        debug!("archive is not a Mac OS Archive Utility ZIP");
        if let MacState::Maybe { uncertain } =
            mem::replace(&mut self.mac, MacState::SpecCompliant)
        {
            for (_, weak) in uncertain {
                if let Some(size) = weak.upgrade() {
                    size.mark_certain();
                }
            }
        }
        self.cd_size_certain = true;
        self.entry_count_certain = true;
        self.compressed_sizes_certain = true;
        self.uncompressed_sizes_certain = true;
        self.file_cursor = None;
    }
}

/// Smallest entry count congruent to `entry_count` modulo 2^16 whose
/// headers could fill `cd_size` bytes.
fn raise_entry_count(mut entry_count: u64, cd_size: u64) -> u64 {
    while entry_count * CDH_MAX_LENGTH_MAC < cd_size {
        entry_count += 0x10000;
    }
    entry_count
}

fn spec_compliant_state(footer: &Footer) -> ZipResult<ArchiveState> {
    footer
        .central_directory_offset
        .checked_add(footer.central_directory_size)
        .filter(|end| *end <= footer.footer_offset)
        .ok_or(ZipError::InvalidArchive(
            "Invalid central directory size or offset",
        ))?;
    if footer.entry_count * spec::CDH_LENGTH > footer.central_directory_size {
        return Err(ZipError::InvalidArchive(
            "Inconsistent Central Directory size and entry count",
        ));
    }

    Ok(ArchiveState {
        cd_offset: footer.central_directory_offset,
        cd_size: footer.central_directory_size,
        entry_count: footer.entry_count,
        cd_offset_certain: true,
        cd_size_certain: true,
        entry_count_certain: true,
        compressed_sizes_certain: true,
        uncompressed_sizes_certain: true,
        mac: MacState::SpecCompliant,
        entry_cursor: footer.central_directory_offset,
        file_cursor: None,
        entries_read: 0,
        first_entry: None,
        next_entry_id: 0,
    })
}

fn finalize_mac(
    footer_offset: u64,
    cd_offset: u64,
    entry_count: u64,
    first: RawEntry,
) -> ArchiveState {
    let cd_size = footer_offset - cd_offset;
    let entry_count = raise_entry_count(entry_count, cd_size);

    // If a 4 GiB displacement would still fit between the minimum the
    // data region must occupy and the directory, some file may be 4 GiB
    // bigger than its header claims.
    let min_total_data_size = entry_count * spec::CDH_LENGTH
        + first.compressed_size
        + first.file_name_raw.len() as u64
        + first.extra_fields.len() as u64 * 16;
    let compressed_sizes_certain = min_total_data_size + FOUR_GIB > cd_offset;
    if !compressed_sizes_certain {
        debug!("file data region could hide a 4 GiB displacement, compressed sizes tentative");
    }

    ArchiveState {
        cd_offset,
        cd_size,
        entry_count,
        cd_offset_certain: true,
        cd_size_certain: true,
        entry_count_certain: (entry_count + 0x10000) * spec::CDH_LENGTH > cd_size,
        compressed_sizes_certain,
        uncompressed_sizes_certain: false,
        mac: MacState::Definite,
        entry_cursor: cd_offset,
        file_cursor: Some(0),
        entries_read: 0,
        first_entry: Some(first),
        next_entry_id: 0,
    }
}

fn finalize_maybe_mac(footer: &Footer, first: RawEntry) -> ZipResult<ArchiveState> {
    let cd_offset = footer.central_directory_offset;
    let cd_size = footer.central_directory_size;
    let entry_count = footer.entry_count;
    let cd_end = cd_offset
        .checked_add(cd_size)
        .filter(|end| *end <= footer.footer_offset)
        .ok_or(ZipError::InvalidArchive(
            "Invalid central directory size or offset",
        ))?;

    // The directory may extend beyond its claimed size when that size
    // was truncated; both it and the count stay tentative in that case.
    let cd_may_be_larger = cd_end < footer.footer_offset;
    let entry_count_certain = if cd_may_be_larger {
        false
    } else {
        (entry_count + 0x10000) * spec::CDH_LENGTH > cd_size
    };

    Ok(ArchiveState {
        cd_offset,
        cd_size,
        entry_count,
        cd_offset_certain: true,
        cd_size_certain: !cd_may_be_larger,
        entry_count_certain,
        compressed_sizes_certain: true,
        uncompressed_sizes_certain: false,
        mac: MacState::Maybe {
            uncertain: IndexMap::new(),
        },
        entry_cursor: cd_offset,
        file_cursor: Some(0),
        entries_read: 0,
        first_entry: Some(first),
        next_entry_id: 0,
    })
}

/// Try to read a Central Directory File Header at `offset`; a bad
/// signature or a short read means "nothing here", not failure.
async fn probe_entry(
    reader: &ArchiveReader,
    offset: u64,
    limit: u64,
) -> ZipResult<Option<RawEntry>> {
    match spec::read_raw_entry(reader, offset, limit).await {
        Ok(entry) => Ok(Some(entry)),
        Err(ZipError::InvalidArchive(_)) => Ok(None),
        Err(ZipError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether a central directory entry could have been written by the
/// Archive Utility.
///
/// The Utility's output is rigid: `version made by` 789, no comments, no
/// ZIP64. Ordinary files are deflated with a data descriptor; folders,
/// empty files and symlinks are stored with equal sizes and distinguish
/// themselves by the trailing slash and the presence of the 22613 extra
/// field (symlinks carry no extra fields, and only a symlink may pair
/// content with the stored shape when its name has no trailing slash).
pub(crate) fn entry_matches_mac_signature(entry: &RawEntry, is_first: bool) -> bool {
    let header = &entry.header;
    if header.version_made_by != MAC_VERSION_MADE_BY {
        return false;
    }
    if header.file_comment_length != 0 {
        return false;
    }
    if entry.has_zip64_field() {
        return false;
    }
    if is_first && entry.header_offset != 0 {
        return false;
    }

    let trailing_slash = entry.file_name_raw.last() == Some(&b'/');
    let has_mac_extra_field = entry.extra_fields.len() == 1
        && entry.extra_fields[0].id == MAC_EXTRA_FIELD_ID
        && entry.extra_fields[0].data.len() == 8;

    if header.version_needed == 20
        && header.general_purpose_flags == 8
        && header.compression_method == 8
        && !trailing_slash
    {
        // An ordinary file, deflated, sizes deferred to the descriptor.
        return has_mac_extra_field;
    }

    if header.version_needed == 10
        && header.general_purpose_flags == 0
        && header.compression_method == 0
        && entry.uncompressed_size == entry.compressed_size
    {
        if has_mac_extra_field {
            // Folder or empty file
            return true;
        }
        // Symlink: no extra fields, never a trailing slash
        return entry.extra_fields.is_empty() && !trailing_slash;
    }

    false
}

/// Whether a Local File Header looks like the Archive Utility's: zeroed
/// CRC and sizes (they go in the data descriptor), the same file name
/// length as the central directory, and one 16-byte local extra field
/// per central extra field.
pub(crate) fn local_header_matches_mac_signature(
    local: &spec::LocalFileHeader,
    central_file_name_length: u16,
    extra_field_count: usize,
) -> bool {
    local.crc32 == 0
        && local.compressed_size == 0
        && local.uncompressed_size == 0
        && local.file_name_length == central_file_name_length
        && local.extra_field_length as usize == extra_field_count * 16
}

/// Reconcile the footer claims with the physical layout and produce the
/// archive's initial state.
pub(crate) async fn resolve_central_directory(
    reader: &ArchiveReader,
    footer: &Footer,
    support_mac_archive: bool,
) -> ZipResult<ArchiveState> {
    let footer_offset = footer.footer_offset;
    let mut entry_count = footer.entry_count;
    let mut cd_size = footer.central_directory_size;
    let cd_offset = footer.central_directory_offset;

    if footer.missing_zip64_locator {
        debug!("ZIP64 sentinel without a locator record, evaluating the Mac hypothesis");
    }

    // Step 1 — early exits. A ZIP64 archive, a trailing comment, or an
    // end-of-directory position that does not even match modulo 2^32
    // cannot be the Archive Utility's work; take the claims verbatim.
    let wrapped_end_matches = cd_offset.wrapping_add(cd_size) & 0xFFFF_FFFF
        == footer_offset & 0xFFFF_FFFF;
    if !support_mac_archive
        || footer.is_zip64
        || !footer.comment.is_empty()
        || !wrapped_end_matches
    {
        return spec_compliant_state(footer);
    }

    // Step 2 — empty archive. No room for even one header after the
    // claimed offset means the directory must be empty.
    if entry_count == 0 && cd_offset + spec::CDH_LENGTH > footer_offset {
        if cd_size != 0 {
            return Err(ZipError::InvalidArchive(
                "Invalid central directory size or offset",
            ));
        }
        return spec_compliant_state(footer);
    }

    let mut definitely_mac = false;

    // Step 3 — a directory smaller than 46 bytes per claimed entry is
    // impossible. If it can grow up to the footer, the size field was
    // truncated; otherwise the claims are beyond repair.
    if cd_size < entry_count * spec::CDH_LENGTH {
        if cd_offset + entry_count * spec::CDH_LENGTH <= footer_offset {
            cd_size = footer_offset - cd_offset;
            definitely_mac = true;
            debug!("claimed directory size impossibly small, grown to {cd_size}");
        } else {
            return Err(ZipError::InvalidArchive(
                "Inconsistent Central Directory size and entry count",
            ));
        }
    }

    // Step 4 — a count too low to fill the directory even with maximal
    // headers means the count field was truncated modulo 2^16.
    let raised = raise_entry_count(entry_count, cd_size);
    if raised != entry_count {
        entry_count = raised;
        definitely_mac = true;
        debug!("claimed entry count impossibly small, raised to {entry_count}");
    }

    // Step 5 — probe the claimed offset.
    if let Some(first) = probe_entry(reader, cd_offset, footer_offset).await? {
        let mac_like = entry_matches_mac_signature(&first, true);
        if !definitely_mac && !mac_like {
            // A verifiably non-Mac first entry exactly where the footer
            // said: spec-compliant.
            let mut state = spec_compliant_state(footer)?;
            state.first_entry = Some(first);
            return Ok(state);
        }
        if mac_like {
            if definitely_mac {
                return Ok(finalize_mac(footer_offset, cd_offset, entry_count, first));
            }
            return finalize_maybe_mac(footer, first);
        }
        // Impossible claims but a non-Mac entry at the stated offset:
        // fall through to the displaced search.
    }

    // Step 6 — the directory is not at its stated offset; look for it at
    // every position congruent modulo 2^32, highest first.
    let needed = cmp::max(cd_size, entry_count * spec::CDH_LENGTH);
    let ceiling = footer_offset.saturating_sub(needed);
    if ceiling >= cd_offset {
        let strides = (ceiling - cd_offset) / FOUR_GIB;
        for stride in (0..=strides).rev() {
            let candidate = cd_offset + stride * FOUR_GIB;
            if let Some(first) = probe_entry(reader, candidate, footer_offset).await? {
                if entry_matches_mac_signature(&first, true) {
                    debug!("central directory found at {candidate}, {stride} wraparounds above its claimed offset");
                    return Ok(finalize_mac(footer_offset, candidate, entry_count, first));
                }
            }
        }
    }

    if entry_count > 0 || cd_size > 0 {
        return Err(ZipError::InvalidArchive(
            "Could not locate the Central Directory",
        ));
    }
    spec_compliant_state(footer)
}

/// Confirm or correct a freshly parsed entry's compressed size.
///
/// Only reachable once the archive is definitely Mac with file data
/// large enough to hide a 4 GiB displacement. The state lock is released
/// across every read, and the global flag is re-checked after each one
/// because a concurrent stream may settle the question first.
pub(crate) async fn resolve_compressed_size(
    reader: &ArchiveReader,
    state: &Mutex<ArchiveState>,
    footer_offset: u64,
    entry: &RawEntry,
    file_cursor: u64,
) -> ZipResult<u64> {
    let (cd_offset, entries_remaining, definite) = {
        let st = state.lock();
        (
            st.cd_offset,
            st.entry_count - st.entries_read - 1,
            st.mac.is_definite(),
        )
    };

    let local_extra_length = entry.extra_fields.len() as u64 * 16;
    let file_data_offset =
        file_cursor + spec::LFH_LENGTH + entry.file_name_raw.len() as u64 + local_extra_length;
    let descriptor_length = if entry.header.compression_method == 8 {
        spec::DATA_DESCRIPTOR_LENGTH
    } else {
        0
    };
    let stated = entry.compressed_size;

    // 1. When the space left after this entry could no longer swallow
    // one more wraparound, no future entry can be displaced either.
    let end_at_stated = file_data_offset + stated + descriptor_length;
    let remaining_data_space = cd_offset.saturating_sub(end_at_stated);
    if remaining_data_space < entries_remaining * spec::LFH_LENGTH + FOUR_GIB {
        state.lock().compressed_sizes_certain = true;
        return Ok(stated);
    }

    // 2. The last entry of a Mac archive must consume everything up to
    // the directory.
    if entries_remaining == 0 {
        if !definite {
            return Err(ZipError::Logic);
        }
        let actual = cd_offset
            .checked_sub(file_data_offset + descriptor_length)
            .ok_or(ZipError::InvalidArchive("Invalid location for file data"))?;
        if actual < stated || (actual - stated) % FOUR_GIB != 0 {
            return Err(ZipError::InvalidArchive(
                "File data does not fill the space before the Central Directory",
            ));
        }
        return Ok(actual);
    }

    // 3. Stored entries (folders, empty files, symlinks) are small and
    // state their size exactly; later entries are still in question.
    if entry.header.compression_method == 0 {
        return Ok(stated);
    }

    // 4. Hunt for the data descriptor at every size congruent to the
    // stated one.
    let mut position = file_data_offset + stated;
    while position + spec::DATA_DESCRIPTOR_LENGTH <= cd_offset {
        let probe_length =
            cmp::min(spec::DATA_DESCRIPTOR_LENGTH + 4, cd_offset - position) as usize;
        let buf = reader.read_exact_at(position, probe_length).await?;

        // Re-check after the suspension: a concurrent stream may have
        // resolved the archive meanwhile.
        if state.lock().compressed_sizes_certain {
            return Ok(stated);
        }

        if let Some(descriptor) = spec::DataDescriptor::parse(&buf) {
            let fields_match = descriptor.crc32 == entry.header.crc32
                && descriptor.compressed_size == stated as u32
                && descriptor.uncompressed_size == entry.uncompressed_size as u32;
            let terminated = if position + spec::DATA_DESCRIPTOR_LENGTH == cd_offset {
                true
            } else {
                buf.len() >= 20 && buf[16..20] == spec::LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes()
            };
            if fields_match && terminated {
                let actual = position - file_data_offset;
                if actual != stated {
                    debug!(
                        "data descriptor displaced, compressed size {} grows to {}",
                        stated, actual
                    );
                    state.lock().set_as_mac_archive(footer_offset);
                }
                return Ok(actual);
            }
        }
        position += FOUR_GIB;
    }

    if definite {
        Err(ZipError::InvalidArchive("Data Descriptor not found"))
    } else {
        Err(ZipError::Logic)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::CentralDirectoryHeader;

    fn raw_entry(
        version_needed: u16,
        flags: u16,
        method: u16,
        name: &[u8],
        sizes: (u64, u64),
        extra_fields: Vec<crate::extra_fields::ExtraField>,
    ) -> RawEntry {
        RawEntry {
            header: CentralDirectoryHeader {
                version_made_by: MAC_VERSION_MADE_BY,
                version_needed,
                general_purpose_flags: flags,
                compression_method: method,
                last_mod_time: 0,
                last_mod_date: 0,
                crc32: 0,
                compressed_size: sizes.1 as u32,
                uncompressed_size: sizes.0 as u32,
                file_name_length: name.len() as u16,
                extra_field_length: 0,
                file_comment_length: 0,
                disk_number_start: 0,
                internal_attributes: 0,
                external_attributes: 0,
                header_offset: 0,
            },
            file_name_raw: name.to_vec(),
            comment_raw: Vec::new(),
            extra_fields,
            uncompressed_size: sizes.0,
            compressed_size: sizes.1,
            header_offset: 0,
        }
    }

    fn mac_extra() -> Vec<crate::extra_fields::ExtraField> {
        vec![crate::extra_fields::ExtraField {
            id: MAC_EXTRA_FIELD_ID,
            data: vec![0u8; 8],
        }]
    }

    #[test]
    fn raise_entry_count_steps_by_wraparounds() {
        assert_eq!(raise_entry_count(10, 10 * CDH_MAX_LENGTH_MAC), 10);
        // 3 entries cannot fill what 65539 maximal headers barely can
        let cd_size = 65539 * CDH_MAX_LENGTH_MAC;
        assert_eq!(raise_entry_count(3, cd_size), 3 + 0x10000);
        // Two wraparounds of truncation
        let cd_size = 131075 * CDH_MAX_LENGTH_MAC;
        assert_eq!(raise_entry_count(3, cd_size), 3 + 2 * 0x10000);
    }

    #[test]
    fn mac_signature_ordinary_file() {
        let entry = raw_entry(20, 8, 8, b"file.bin", (0, 0), mac_extra());
        assert!(entry_matches_mac_signature(&entry, true));

        // Wrong version_made_by
        let mut other = entry.clone();
        other.header.version_made_by = 20;
        assert!(!entry_matches_mac_signature(&other, true));

        // A comment disqualifies
        let mut other = entry.clone();
        other.header.file_comment_length = 4;
        assert!(!entry_matches_mac_signature(&other, true));

        // Trailing slash disqualifies the deflated shape
        let other = raw_entry(20, 8, 8, b"dir/", (0, 0), mac_extra());
        assert!(!entry_matches_mac_signature(&other, true));

        // Missing extra field disqualifies a non-symlink
        let other = raw_entry(20, 8, 8, b"file.bin", (0, 0), Vec::new());
        assert!(!entry_matches_mac_signature(&other, true));
    }

    #[test]
    fn mac_signature_folder_empty_file_symlink() {
        // Folder: trailing slash, extra field present
        let folder = raw_entry(10, 0, 0, b"dir/", (0, 0), mac_extra());
        assert!(entry_matches_mac_signature(&folder, true));

        // Empty file: no slash, extra field present
        let empty = raw_entry(10, 0, 0, b"empty", (0, 0), mac_extra());
        assert!(entry_matches_mac_signature(&empty, true));

        // Symlink: no extra fields, equal nonzero sizes, no slash
        let symlink = raw_entry(10, 0, 0, b"link", (11, 11), Vec::new());
        assert!(entry_matches_mac_signature(&symlink, true));

        // A trailing slash with no extra fields fits nothing
        let odd = raw_entry(10, 0, 0, b"dir/", (0, 0), Vec::new());
        assert!(!entry_matches_mac_signature(&odd, true));

        // Unequal sizes cannot be the stored shape
        let odd = raw_entry(10, 0, 0, b"f", (5, 9), mac_extra());
        assert!(!entry_matches_mac_signature(&odd, true));
    }

    #[test]
    fn first_entry_must_sit_at_offset_zero() {
        let mut entry = raw_entry(20, 8, 8, b"file.bin", (0, 0), mac_extra());
        entry.header_offset = 100;
        assert!(!entry_matches_mac_signature(&entry, true));
        assert!(entry_matches_mac_signature(&entry, false));
    }

    #[test]
    fn local_header_signature() {
        let local = spec::LocalFileHeader {
            version_needed: 20,
            general_purpose_flags: 8,
            compression_method: 8,
            last_mod_time: 0,
            last_mod_date: 0,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            file_name_length: 8,
            extra_field_length: 16,
        };
        assert!(local_header_matches_mac_signature(&local, 8, 1));
        assert!(!local_header_matches_mac_signature(&local, 9, 1));
        assert!(!local_header_matches_mac_signature(&local, 8, 2));

        let mut nonzero = spec::LocalFileHeader { crc32: 1, ..local };
        assert!(!local_header_matches_mac_signature(&nonzero, 8, 1));
        nonzero.crc32 = 0;
        nonzero.compressed_size = 7;
        assert!(!local_header_matches_mac_signature(&nonzero, 8, 1));
    }

    use crate::reader::ReadAt;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Mostly-zero source with a few byte runs planted at huge offsets,
    /// standing in for a multi-gigabyte Mac archive.
    struct SparseSource {
        size: u64,
        runs: Vec<(u64, Vec<u8>)>,
    }

    #[async_trait]
    impl ReadAt for SparseSource {
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            if offset >= self.size {
                return Ok(0);
            }
            let n = buf.len().min((self.size - offset) as usize);
            buf[..n].fill(0);
            for (start, bytes) in &self.runs {
                let run_end = start + bytes.len() as u64;
                if *start < offset + n as u64 && run_end > offset {
                    let from = start.max(&offset) - offset;
                    let src_from = offset.saturating_sub(*start);
                    let len = (n as u64 - from).min(bytes.len() as u64 - src_from);
                    buf[from as usize..(from + len) as usize].copy_from_slice(
                        &bytes[src_from as usize..(src_from + len) as usize],
                    );
                }
            }
            Ok(n)
        }
    }

    fn definite_mac_state(cd_offset: u64, cd_size: u64, entry_count: u64) -> ArchiveState {
        ArchiveState {
            cd_offset,
            cd_size,
            entry_count,
            cd_offset_certain: true,
            cd_size_certain: true,
            entry_count_certain: true,
            compressed_sizes_certain: false,
            uncompressed_sizes_certain: false,
            mac: MacState::Definite,
            entry_cursor: cd_offset,
            file_cursor: Some(0),
            entries_read: 0,
            first_entry: None,
            next_entry_id: 0,
        }
    }

    fn descriptor_bytes(crc: u32, compressed: u32, uncompressed: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&spec::DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&compressed.to_le_bytes());
        out.extend_from_slice(&uncompressed.to_le_bytes());
        out
    }

    #[tokio::test]
    async fn displaced_data_descriptor_enlarges_the_entry() {
        let mut entry = raw_entry(20, 8, 8, b"large", (400, 100), mac_extra());
        entry.header.crc32 = 0xabcd1234;

        // The local header occupies 30 + 5 + 16 bytes; the descriptor
        // actually sits one wraparound past the stated size.
        let file_data_offset = 30 + 5 + 16;
        let descriptor_at = file_data_offset + 100 + FOUR_GIB;
        let mut run = descriptor_bytes(0xabcd1234, 100, 400);
        run.extend_from_slice(&spec::LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes());
        let cd_offset = descriptor_at + 16 + 30 + FOUR_GIB + FOUR_GIB;
        let source = SparseSource {
            size: cd_offset + 46,
            runs: vec![(descriptor_at, run)],
        };
        let reader = ArchiveReader::new(Arc::new(source), cd_offset + 46);
        let state = Mutex::new(definite_mac_state(cd_offset, 46, 2));

        let resolved =
            resolve_compressed_size(&reader, &state, cd_offset + 46, &entry, 0)
                .await
                .unwrap();
        assert_eq!(resolved, 100 + FOUR_GIB);
    }

    #[tokio::test]
    async fn tight_data_region_settles_all_future_sizes() {
        let entry = raw_entry(20, 8, 8, b"small", (400, 100), mac_extra());

        // Not enough space below the directory to hide a wraparound.
        let cd_offset = 10_000;
        let source = SparseSource {
            size: cd_offset + 46,
            runs: Vec::new(),
        };
        let reader = ArchiveReader::new(Arc::new(source), cd_offset + 46);
        let state = Mutex::new(definite_mac_state(cd_offset, 46, 3));

        let resolved =
            resolve_compressed_size(&reader, &state, cd_offset + 46, &entry, 0)
                .await
                .unwrap();
        assert_eq!(resolved, 100);
        assert!(state.lock().compressed_sizes_certain);
    }

    #[tokio::test]
    async fn missing_data_descriptor_is_fatal_for_a_definite_mac_archive() {
        let entry = raw_entry(20, 8, 8, b"ghost", (400, 100), mac_extra());

        let cd_offset = 30 + 5 + 16 + 100 + 16 + 30 + 3 * FOUR_GIB;
        let source = SparseSource {
            size: cd_offset + 46,
            runs: Vec::new(),
        };
        let reader = ArchiveReader::new(Arc::new(source), cd_offset + 46);
        let state = Mutex::new(definite_mac_state(cd_offset, 46, 2));

        let err = resolve_compressed_size(&reader, &state, cd_offset + 46, &entry, 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Data Descriptor not found"));
    }

    fn mac_cdh_bytes(name: &[u8], header_offset: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&spec::CENTRAL_DIRECTORY_HEADER_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&MAC_VERSION_MADE_BY.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes()); // flags: data descriptor
        out.extend_from_slice(&8u16.to_le_bytes()); // deflate
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x11223344u32.to_le_bytes());
        out.extend_from_slice(&100u32.to_le_bytes());
        out.extend_from_slice(&400u32.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&12u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(0o100644u32 << 16).to_le_bytes());
        out.extend_from_slice(&header_offset.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&MAC_EXTRA_FIELD_ID.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out
    }

    #[tokio::test]
    async fn anchor_finds_a_directory_displaced_by_wraparound() {
        // The true directory sits one 4 GiB stride above the offset the
        // footer claims.
        let claimed_cd_offset = 1_000u64;
        let true_cd_offset = claimed_cd_offset + FOUR_GIB;
        let cdh = mac_cdh_bytes(b"big.bin", 0);
        let cd_size = cdh.len() as u64;
        let footer_offset = true_cd_offset + cd_size;

        let source = SparseSource {
            size: footer_offset + spec::EOCDR_LENGTH,
            runs: vec![(true_cd_offset, cdh)],
        };
        let reader = ArchiveReader::new(Arc::new(source), footer_offset + spec::EOCDR_LENGTH);
        let footer = Footer {
            footer_offset,
            entry_count: 1,
            central_directory_size: cd_size,
            central_directory_offset: claimed_cd_offset,
            is_zip64: false,
            comment: Vec::new(),
            missing_zip64_locator: false,
        };

        let state = resolve_central_directory(&reader, &footer, true)
            .await
            .unwrap();
        assert!(state.mac.is_definite());
        assert_eq!(state.cd_offset, true_cd_offset);
        assert_eq!(state.cd_size, cd_size);
        assert_eq!(state.entry_count, 1);
    }
}
