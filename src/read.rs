//! Types for reading ZIP archives

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use futures_core::stream::Stream;
use log::debug;
use parking_lot::Mutex;

use crate::combinators::EntryStream;
use crate::compression::CompressionMethod;
use crate::cp437::FromCp437;
use crate::extra_fields;
use crate::mac::{self, ArchiveState, MacState, CDH_MAX_LENGTH_MAC, DEFLATE_MAX_EXPANSION, FOUR_GIB};
use crate::reader::{ArchiveReader, BufferReader, FileReader, ReadAt};
use crate::result::{ZipError, ZipResult};
use crate::spec;
use crate::types::{AtomicU64, UncertainSize, ZipEntry};
use crate::util;

/// Options controlling how an archive is opened and how its entries are
/// decoded and validated.
///
/// ```
/// use lazyzip::OpenOptions;
///
/// let options = OpenOptions::default()
///     .strict_filenames(true)
///     .support_mac_archive(false);
/// # let _ = options;
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) decode_strings: bool,
    pub(crate) validate_entry_sizes: bool,
    pub(crate) validate_filenames: bool,
    pub(crate) strict_filenames: bool,
    pub(crate) support_mac_archive: bool,
}

impl Default for OpenOptions {
    fn default() -> OpenOptions {
        OpenOptions {
            decode_strings: true,
            validate_entry_sizes: true,
            validate_filenames: true,
            strict_filenames: false,
            support_mac_archive: true,
        }
    }
}

impl OpenOptions {
    /// Decode file names and comments to text (CP437 or UTF-8 per the
    /// language-encoding flag). When disabled only the raw bytes are
    /// available. Defaults to `true`.
    pub fn decode_strings(mut self, decode_strings: bool) -> OpenOptions {
        self.decode_strings = decode_strings;
        self
    }

    /// Check size consistency of stored entries and verify uncompressed
    /// sizes at the end of each stream. Defaults to `true`.
    pub fn validate_entry_sizes(mut self, validate_entry_sizes: bool) -> OpenOptions {
        self.validate_entry_sizes = validate_entry_sizes;
        self
    }

    /// Reject absolute and upward-traversing file names. Defaults to
    /// `true`.
    pub fn validate_filenames(mut self, validate_filenames: bool) -> OpenOptions {
        self.validate_filenames = validate_filenames;
        self
    }

    /// Reject backslashes in file names instead of mapping them to `/`.
    /// Defaults to `false`.
    pub fn strict_filenames(mut self, strict_filenames: bool) -> OpenOptions {
        self.strict_filenames = strict_filenames;
        self
    }

    /// Enable the Mac OS Archive Utility heuristics that recover sizes,
    /// offsets and entry counts truncated modulo 2^32 / 2^16. Defaults
    /// to `true`.
    pub fn support_mac_archive(mut self, support_mac_archive: bool) -> OpenOptions {
        self.support_mac_archive = support_mac_archive;
        self
    }
}

/// Options for one entry read stream.
///
/// All fields default to "auto": decompress when the entry is
/// compressed, reject encrypted entries, validate the CRC-32 when the
/// stream yields the entry's full stored content, and cover the whole
/// compressed byte range.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub(crate) decompress: Option<bool>,
    pub(crate) decrypt: Option<bool>,
    pub(crate) validate_crc32: Option<bool>,
    pub(crate) start: Option<u64>,
    pub(crate) end: Option<u64>,
}

impl StreamOptions {
    /// Inflate the file data (`true`) or deliver it raw (`false`).
    pub fn decompress(mut self, decompress: bool) -> StreamOptions {
        self.decompress = Some(decompress);
        self
    }

    /// Requesting decryption always fails; passing `false` allows raw
    /// reads of encrypted file data.
    pub fn decrypt(mut self, decrypt: bool) -> StreamOptions {
        self.decrypt = Some(decrypt);
        self
    }

    /// Force CRC-32 validation on or off.
    pub fn validate_crc32(mut self, validate_crc32: bool) -> StreamOptions {
        self.validate_crc32 = Some(validate_crc32);
        self
    }

    /// First byte of the compressed range to read.
    pub fn start(mut self, start: u64) -> StreamOptions {
        self.start = Some(start);
        self
    }

    /// One past the last byte of the compressed range to read.
    pub fn end(mut self, end: u64) -> StreamOptions {
        self.end = Some(end);
        self
    }
}

/// The shared body of an open archive: the reader handle, the immutable
/// footer facts, and the mutable directory state behind its lock.
pub(crate) struct ArchiveInner {
    pub(crate) reader: ArchiveReader,
    pub(crate) footer_offset: u64,
    pub(crate) is_zip64: bool,
    pub(crate) comment_raw: Vec<u8>,
    pub(crate) comment: Option<String>,
    pub(crate) options: OpenOptions,
    pub(crate) state: Mutex<ArchiveState>,
    reading: AtomicBool,
}

impl ArchiveInner {
    /// A stream proved the Mac reading; settle a still-open question.
    pub(crate) fn promote_to_mac_if_maybe(&self) {
        let mut state = self.state.lock();
        if state.mac.is_maybe() {
            state.set_as_mac_archive(self.footer_offset);
        }
    }

    /// An entry's uncompressed size was confirmed; stop tracking it.
    pub(crate) fn remove_uncertain(&self, id: u64) {
        let mut state = self.state.lock();
        if let MacState::Maybe { uncertain } = &mut state.mac {
            uncertain.shift_remove(&id);
        }
    }
}

impl std::fmt::Debug for ArchiveInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveInner")
            .field("footer_offset", &self.footer_offset)
            .field("is_zip64", &self.is_zip64)
            .finish_non_exhaustive()
    }
}

/// Releases the `read_entry` serialization flag on every exit path.
struct ReadEntryGuard<'a>(&'a AtomicBool);

impl<'a> ReadEntryGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> ZipResult<ReadEntryGuard<'a>> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(ZipError::InvalidUsage(
                "Cannot call readEntry before the previous call completes",
            ));
        }
        Ok(ReadEntryGuard(flag))
    }
}

impl Drop for ReadEntryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// ZIP archive reader.
///
/// Entries are produced lazily by [`ZipArchive::read_entry`]; their
/// contents are streamed by [`ZipArchive::open_read_stream`] without
/// ever materializing the archive in memory or on disk. The handle is
/// cheap to clone; all clones share one underlying reader and one
/// directory cursor.
///
/// ```no_run
/// use tokio::io::AsyncReadExt;
///
/// # async fn list(path: &str) -> lazyzip::ZipResult<()> {
/// let archive = lazyzip::ZipArchive::open(path, Default::default()).await?;
/// while let Some(entry) = archive.read_entry().await? {
///     println!("{}", entry.file_name().unwrap_or("<binary name>"));
///     if !entry.is_dir() {
///         let mut stream = archive
///             .open_read_stream(&entry, Default::default())
///             .await?;
///         let mut content = Vec::new();
///         stream.read_to_end(&mut content).await?;
///     }
/// }
/// archive.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ZipArchive {
    inner: Arc<ArchiveInner>,
}

impl ZipArchive {
    /// Open the archive at `path`.
    pub async fn open(path: impl AsRef<Path>, options: OpenOptions) -> ZipResult<ZipArchive> {
        let reader = FileReader::open(path).await?;
        let size = reader.len();
        Self::from_parts(Arc::new(reader), size, options).await
    }

    /// Read an archive from a file descriptor owned by the caller. The
    /// descriptor is never closed, not even by [`ZipArchive::close`].
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, open descriptor supporting positional
    /// reads, and must outlive the archive and all of its streams.
    #[cfg(unix)]
    pub async unsafe fn from_fd(
        fd: std::os::unix::io::RawFd,
        options: OpenOptions,
    ) -> ZipResult<ZipArchive> {
        let reader = crate::reader::FdReader::from_raw_fd(fd).await?;
        let size = reader.len();
        Self::from_parts(Arc::new(reader), size, options).await
    }

    /// Read an archive held in memory.
    pub async fn from_buffer(data: Vec<u8>, options: OpenOptions) -> ZipResult<ZipArchive> {
        let reader = BufferReader::new(data);
        let size = reader.len();
        Self::from_parts(Arc::new(reader), size, options).await
    }

    /// Read an archive from a caller-supplied [`ReadAt`] source of
    /// `size` total bytes.
    pub async fn from_reader<R: ReadAt + 'static>(
        reader: R,
        size: u64,
        options: OpenOptions,
    ) -> ZipResult<ZipArchive> {
        Self::from_parts(Arc::new(reader), size, options).await
    }

    async fn from_parts(
        source: Arc<dyn ReadAt + 'static>,
        size: u64,
        options: OpenOptions,
    ) -> ZipResult<ZipArchive> {
        let reader = ArchiveReader::new(source, size);
        let footer = spec::find_footer(&reader, options.support_mac_archive).await?;
        let state =
            mac::resolve_central_directory(&reader, &footer, options.support_mac_archive).await?;
        debug!(
            "directory anchored at {} (certain: {}), {} entries claimed (certain: {})",
            state.cd_offset, state.cd_offset_certain, state.entry_count, state.entry_count_certain
        );

        // There is no language-encoding flag for the archive comment;
        // CP437 is the only safe reading.
        let comment = options
            .decode_strings
            .then(|| footer.comment.clone().from_cp437());

        Ok(ZipArchive {
            inner: Arc::new(ArchiveInner {
                reader,
                footer_offset: footer.footer_offset,
                is_zip64: footer.is_zip64,
                comment_raw: footer.comment,
                comment,
                options,
                state: Mutex::new(state),
                reading: AtomicBool::new(false),
            }),
        })
    }

    /// Whether the archive (and its reader) is still open.
    pub fn is_open(&self) -> bool {
        self.inner.reader.is_open()
    }

    /// Whether the archive has been proven to be a Mac OS Archive
    /// Utility ZIP with truncated metadata.
    pub fn is_mac_archive(&self) -> bool {
        self.inner.state.lock().mac.is_definite()
    }

    /// Whether the archive's layout is still consistent with both the
    /// spec-compliant and the Mac reading.
    pub fn is_maybe_mac_archive(&self) -> bool {
        self.inner.state.lock().mac.is_maybe()
    }

    /// Whether the archive uses the ZIP64 extension.
    pub fn is_zip64(&self) -> bool {
        self.inner.is_zip64
    }

    /// Total size of the underlying byte source.
    pub fn size(&self) -> u64 {
        self.inner.reader.size()
    }

    /// The archive comment, when `decode_strings` is enabled.
    pub fn comment(&self) -> Option<&str> {
        self.inner.comment.as_deref()
    }

    /// The raw bytes of the archive comment.
    pub fn comment_raw(&self) -> &[u8] {
        &self.inner.comment_raw
    }

    /// How many entries have been produced so far.
    pub fn entries_read(&self) -> u64 {
        self.inner.state.lock().entries_read
    }

    /// The number of entries the directory is currently believed to
    /// hold. For a (possible) Mac archive this can still grow while
    /// iterating.
    pub fn entry_count(&self) -> u64 {
        self.inner.state.lock().entry_count
    }

    /// Produce the next entry, or `None` once the directory is
    /// exhausted.
    ///
    /// Strictly serial: a second call racing an unfinished one fails.
    pub async fn read_entry(&self) -> ZipResult<Option<ZipEntry>> {
        let inner = &self.inner;
        if !inner.reader.is_open() {
            return Err(ZipError::InvalidUsage("archive has been closed"));
        }
        let _guard = ReadEntryGuard::acquire(&inner.reading)?;

        // Termination bookkeeping, and the cursor for this entry.
        let (cursor, limit, cached) = {
            let mut state = inner.state.lock();
            if state.entries_read == state.entry_count {
                if state.entry_count_certain {
                    return Ok(None);
                }
                let effective_end = if state.cd_size_certain {
                    state.cd_end()
                } else {
                    inner.footer_offset
                };
                if state.entry_cursor >= effective_end {
                    // The directory ended exactly where the count said;
                    // the claim is now confirmed.
                    state.entry_count_certain = true;
                    return Ok(None);
                }
                // Another header follows a supposedly exhausted count:
                // one more 2^16 truncation.
                if state.mac.is_definite() {
                    state.entry_count += 0x10000;
                    debug!(
                        "directory continues past the entry count, raised to {}",
                        state.entry_count
                    );
                } else if state.mac.is_maybe() {
                    // Only truncation explains a directory that outlives
                    // its claims.
                    state.set_as_mac_archive(inner.footer_offset);
                    if state.entries_read == state.entry_count {
                        return Err(ZipError::Logic);
                    }
                } else {
                    return Err(ZipError::Logic);
                }
            }
            let limit = if state.cd_size_certain {
                state.cd_end()
            } else {
                inner.footer_offset
            };
            (state.entry_cursor, limit, state.first_entry.take())
        };

        let raw = match cached {
            Some(first) => first,
            None => spec::read_raw_entry(&inner.reader, cursor, limit).await?,
        };

        if raw.header.general_purpose_flags & (1 << 6) != 0 {
            return Err(ZipError::UnsupportedArchive(
                "Strong encryption is not supported",
            ));
        }

        // Reconcile the entry with the Mac state machine.
        let mut resolved_header_offset = raw.header_offset;
        let mut uncompressed_size = raw.uncompressed_size;
        let mut size_certain = true;
        let mut register_uncertain = false;
        let needs_compressed_resolution;
        let file_cursor_snapshot;
        {
            let mut state = inner.state.lock();
            let is_first = state.entries_read == 0;
            if state.mac.is_definite() {
                let file_cursor = state.file_cursor.ok_or(ZipError::Logic)?;
                let offset_consistent = raw.header_offset == file_cursor & 0xFFFF_FFFF;
                if !mac::entry_matches_mac_signature(&raw, is_first) || !offset_consistent {
                    return Err(ZipError::InvalidArchive(
                        "Misidentified Mac OS Archive Utility ZIP",
                    ));
                }
                // The tracked cursor is the entry's true location.
                resolved_header_offset = file_cursor;
            } else if state.mac.is_maybe() {
                let file_cursor = state.file_cursor.ok_or(ZipError::Logic)?;
                let offset_consistent = raw.header_offset == file_cursor & 0xFFFF_FFFF;
                if !mac::entry_matches_mac_signature(&raw, is_first) || !offset_consistent {
                    // Evidence a Mac archive cannot contain.
                    state.set_as_not_mac_archive();
                    let after = cursor + raw.total_length();
                    let remaining_needed =
                        (state.entry_count - state.entries_read - 1) * spec::CDH_LENGTH;
                    if state.cd_end().saturating_sub(after) < remaining_needed {
                        return Err(ZipError::InvalidArchive(
                            "Inconsistent Central Directory size and entry count",
                        ));
                    }
                } else if file_cursor >= FOUR_GIB {
                    // Only the wrapped reading places a header here.
                    state.set_as_mac_archive(inner.footer_offset);
                    resolved_header_offset = file_cursor;
                } else {
                    let after = cursor + raw.total_length();
                    let remaining = state.entry_count - state.entries_read - 1;
                    let remaining_space = state.cd_end().saturating_sub(after);
                    if remaining_space < remaining * spec::CDH_LENGTH
                        || remaining * CDH_MAX_LENGTH_MAC < remaining_space
                    {
                        // The claimed count cannot match the space the
                        // remaining headers occupy under either bound.
                        state.set_as_mac_archive(inner.footer_offset);
                    }
                    resolved_header_offset = file_cursor;
                }
            }

            if !state.uncompressed_sizes_certain {
                match raw.header.compression_method {
                    0 => {
                        // Stored entries of a Mac archive are folders,
                        // empty files, or symlinks; sizes are equal and
                        // accurate.
                        uncompressed_size = raw.compressed_size;
                    }
                    8 => {
                        let max_uncompressed =
                            raw.compressed_size.saturating_mul(DEFLATE_MAX_EXPANSION);
                        if uncompressed_size + FOUR_GIB <= max_uncompressed {
                            size_certain = false;
                            register_uncertain = state.mac.is_maybe();
                        }
                    }
                    _ => {}
                }
            }
            needs_compressed_resolution = !state.compressed_sizes_certain;
            file_cursor_snapshot = state.file_cursor;
        }

        let compressed_size = if needs_compressed_resolution {
            let file_cursor = file_cursor_snapshot.ok_or(ZipError::Logic)?;
            mac::resolve_compressed_size(
                &inner.reader,
                &inner.state,
                inner.footer_offset,
                &raw,
                file_cursor,
            )
            .await?
        } else {
            raw.compressed_size
        };

        // String decoding and the filename policies.
        let options = &inner.options;
        let file_name = if options.decode_strings {
            let name = match extra_fields::unicode_path(&raw.extra_fields, &raw.file_name_raw) {
                Some(name) => name,
                None if raw.header.general_purpose_flags & (1 << 11) != 0 => {
                    String::from_utf8_lossy(&raw.file_name_raw).into_owned()
                }
                None => raw.file_name_raw.clone().from_cp437(),
            };
            let name = util::apply_backslash_policy(name, options.strict_filenames)?;
            if options.validate_filenames {
                util::validate_file_name(&name)?;
            }
            Some(name)
        } else {
            None
        };
        let comment = options.decode_strings.then(|| {
            if raw.header.general_purpose_flags & (1 << 11) != 0 {
                String::from_utf8_lossy(&raw.comment_raw).into_owned()
            } else {
                raw.comment_raw.clone().from_cp437()
            }
        });

        if options.validate_entry_sizes && raw.header.compression_method == 0 {
            // Traditional encryption prepends a 12-byte header to the
            // stored data.
            let expected = uncompressed_size
                + if raw.header.general_purpose_flags & 1 != 0 {
                    12
                } else {
                    0
                };
            if compressed_size != expected {
                return Err(ZipError::InvalidArchive(
                    "Compressed and uncompressed sizes differ for a stored entry",
                ));
            }
        }

        // Commit: cursors move only after every validation passed.
        let descriptor_length = if raw.header.compression_method == 8 {
            spec::DATA_DESCRIPTOR_LENGTH
        } else {
            0
        };
        let entry = {
            let mut state = inner.state.lock();
            state.entry_cursor = cursor + raw.total_length();
            state.entries_read += 1;
            if let Some(file_cursor) = state.file_cursor.as_mut() {
                *file_cursor += spec::LFH_LENGTH
                    + raw.file_name_raw.len() as u64
                    + raw.extra_fields.len() as u64 * 16
                    + compressed_size
                    + descriptor_length;
            }
            let id = state.next_entry_id;
            state.next_entry_id += 1;

            let uncompressed = Arc::new(UncertainSize::new(uncompressed_size, size_certain));
            if register_uncertain && !size_certain {
                if let MacState::Maybe { uncertain } = &mut state.mac {
                    uncertain.insert(id, Arc::downgrade(&uncompressed));
                }
            }

            ZipEntry {
                archive: Arc::downgrade(inner),
                id,
                file_name_raw: raw.file_name_raw,
                file_name,
                comment_raw: raw.comment_raw,
                comment,
                version_made_by: raw.header.version_made_by,
                version_needed: raw.header.version_needed,
                general_purpose_flags: raw.header.general_purpose_flags,
                compression_method: CompressionMethod::from_u16(raw.header.compression_method),
                last_mod_time: raw.header.last_mod_time,
                last_mod_date: raw.header.last_mod_date,
                crc32: raw.header.crc32,
                compressed_size,
                uncompressed,
                internal_attributes: raw.header.internal_attributes,
                external_attributes: raw.header.external_attributes,
                file_header_offset: resolved_header_offset,
                file_data_offset: AtomicU64::new(0),
                extra_fields: raw.extra_fields,
            }
        };
        Ok(Some(entry))
    }

    /// Produce up to `limit` entries (all remaining entries when `None`).
    pub async fn read_entries(&self, limit: Option<usize>) -> ZipResult<Vec<ZipEntry>> {
        let mut entries = Vec::new();
        while limit.map_or(true, |n| entries.len() < n) {
            match self.read_entry().await? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// The entries as an async stream.
    pub fn entries(&self) -> impl Stream<Item = ZipResult<ZipEntry>> + Send + 'static {
        let archive = self.clone();
        try_stream! {
            while let Some(entry) = archive.read_entry().await? {
                yield entry;
            }
        }
    }

    /// Open a stream over `entry`'s file data.
    ///
    /// Validates the entry's Local File Header, resolves the data
    /// offset, and composes the requested transform chain (inflate,
    /// uncompressed-size validation, CRC-32). Multiple streams may be
    /// open concurrently on one archive.
    pub async fn open_read_stream(
        &self,
        entry: &ZipEntry,
        options: StreamOptions,
    ) -> ZipResult<EntryStream> {
        let inner = &self.inner;
        if !inner.reader.is_open() {
            return Err(ZipError::InvalidUsage("archive has been closed"));
        }
        if !entry.archive.ptr_eq(&Arc::downgrade(inner)) {
            return Err(ZipError::InvalidUsage(
                "Entry does not belong to this archive",
            ));
        }

        if options.decrypt == Some(true) || (options.decrypt.is_none() && entry.is_encrypted()) {
            return Err(ZipError::UnsupportedArchive("Decryption is not supported"));
        }

        let decompress = options.decompress.unwrap_or_else(|| entry.is_compressed());
        if decompress {
            match entry.compression_method {
                CompressionMethod::Deflated => {}
                CompressionMethod::Stored => {
                    return Err(ZipError::InvalidUsage("Entry is not compressed"))
                }
                CompressionMethod::Unsupported(_) => {
                    return Err(ZipError::UnsupportedArchive(
                        "Compression method not supported",
                    ))
                }
            }
            if entry.is_encrypted() {
                return Err(ZipError::InvalidUsage(
                    "Cannot decompress an encrypted entry",
                ));
            }
        }

        let compressed_size = entry.compressed_size;
        let start = options.start.unwrap_or(0);
        let end = options.end.unwrap_or(compressed_size);
        if start > end || end > compressed_size {
            return Err(ZipError::InvalidUsage(
                "Invalid start or end for the requested range",
            ));
        }
        let partial = start != 0 || end != compressed_size;
        if partial && decompress {
            return Err(ZipError::InvalidUsage(
                "Cannot read a partial range when decompressing",
            ));
        }

        let validate_crc32 = match options.validate_crc32 {
            Some(true) if partial => {
                return Err(ZipError::InvalidUsage(
                    "Cannot validate the CRC-32 of a partial range",
                ))
            }
            Some(requested) => requested,
            // Auto: only when the stream yields the entry's entire
            // uncompressed content as stored.
            None => !partial && !decompress && !entry.is_compressed() && !entry.is_encrypted(),
        };

        // Validate the Local File Header and resolve the data offset.
        if entry.file_header_offset + spec::LFH_LENGTH > inner.footer_offset {
            return Err(ZipError::InvalidArchive("Invalid location for file data"));
        }
        let buf = inner
            .reader
            .read_exact_at(entry.file_header_offset, spec::LFH_LENGTH as usize)
            .await?;
        let local = spec::LocalFileHeader::parse(&buf)?;

        {
            let mut state = inner.state.lock();
            if state.mac.could_be_mac() {
                let local_matches = mac::local_header_matches_mac_signature(
                    &local,
                    entry.file_name_raw.len() as u16,
                    entry.extra_fields.len(),
                );
                if !local_matches {
                    if state.mac.is_definite() {
                        return Err(ZipError::InvalidArchive(
                            "Misidentified Mac OS Archive Utility ZIP",
                        ));
                    }
                    state.set_as_not_mac_archive();
                }
            }
        }

        let file_data_offset = entry.file_header_offset
            + spec::LFH_LENGTH
            + local.file_name_length as u64
            + local.extra_field_length as u64;
        entry.file_data_offset.store(file_data_offset);

        if file_data_offset + compressed_size > inner.footer_offset {
            return Err(ZipError::InvalidArchive("Invalid location for file data"));
        }

        let region = inner.reader.stream(file_data_offset + start, end - start)?;
        let size_check = (decompress && inner.options.validate_entry_sizes).then(|| {
            (
                Arc::clone(&entry.uncompressed),
                entry.archive.clone(),
                entry.id,
            )
        });
        let checksum = validate_crc32.then_some(entry.crc32);
        Ok(EntryStream::build(region, decompress, size_check, checksum))
    }

    /// Close the archive's reader. Idempotent; streams already open keep
    /// reading, but no new operation can start.
    pub async fn close(&self) -> ZipResult<()> {
        self.inner.reader.close().await
    }
}

impl ZipEntry {
    /// Open a stream over this entry's file data through its archive.
    pub async fn open_read_stream(&self, options: StreamOptions) -> ZipResult<EntryStream> {
        let inner = self.archive.upgrade().ok_or(ZipError::InvalidUsage(
            "The archive for this entry no longer exists",
        ))?;
        ZipArchive { inner }.open_read_stream(self, options).await
    }
}
