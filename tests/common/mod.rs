//! Shared fixture builders: archives are synthesized byte-by-byte so
//! every test controls exactly what the directory claims.
#![allow(dead_code)]

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::Compression;

pub const LFH_SIG: u32 = 0x04034b50;
pub const CDH_SIG: u32 = 0x02014b50;
pub const EOCDR_SIG: u32 = 0x06054b50;
pub const DD_SIG: u32 = 0x08074b50;
pub const MAC_EXTRA_ID: u16 = 22613;
pub const MAC_VERSION_MADE_BY: u16 = 789;

pub fn deflate(content: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

struct CdRecord {
    version_made_by: u16,
    version_needed: u16,
    flags: u16,
    method: u16,
    mod_time: u16,
    mod_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    external_attrs: u32,
    header_offset: u32,
    name: Vec<u8>,
    extra: Vec<u8>,
    comment: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BuiltEntry {
    pub name: String,
    pub header_offset: u64,
    pub data_offset: u64,
    pub compressed_size: u64,
}

#[derive(Debug)]
pub struct Built {
    pub bytes: Vec<u8>,
    pub cd_offset: u64,
    pub cd_size: u64,
    pub entries: Vec<BuiltEntry>,
}

impl Built {
    pub fn raw_data_of(&self, name: &str) -> &[u8] {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("no fixture entry named {name}"));
        let start = entry.data_offset as usize;
        &self.bytes[start..start + entry.compressed_size as usize]
    }
}

/// Emits well-formed archives by default; the `mac_*` methods write the
/// Archive Utility's exact shapes, and `finish_with` lets tests lie in
/// the footer the way truncation would.
pub struct Builder {
    data: Vec<u8>,
    records: Vec<CdRecord>,
    built: Vec<BuiltEntry>,
}

fn mac_cd_extra() -> Vec<u8> {
    let mut extra = Vec::new();
    extra.extend_from_slice(&MAC_EXTRA_ID.to_le_bytes());
    extra.extend_from_slice(&8u16.to_le_bytes());
    extra.extend_from_slice(&[0u8; 8]);
    extra
}

fn mac_local_extra() -> Vec<u8> {
    let mut extra = Vec::new();
    extra.extend_from_slice(&MAC_EXTRA_ID.to_le_bytes());
    extra.extend_from_slice(&12u16.to_le_bytes());
    extra.extend_from_slice(&[0u8; 12]);
    extra
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            data: Vec::new(),
            records: Vec::new(),
            built: Vec::new(),
        }
    }

    fn push_local(
        &mut self,
        name: &str,
        flags: u16,
        method: u16,
        crc32: u32,
        compressed_size: u32,
        uncompressed_size: u32,
        extra: &[u8],
    ) -> (u64, u64) {
        let header_offset = self.data.len() as u64;
        self.data.extend_from_slice(&LFH_SIG.to_le_bytes());
        self.data.extend_from_slice(&20u16.to_le_bytes());
        self.data.extend_from_slice(&flags.to_le_bytes());
        self.data.extend_from_slice(&method.to_le_bytes());
        self.data.extend_from_slice(&0x5462u16.to_le_bytes()); // mod time
        self.data.extend_from_slice(&0x58a1u16.to_le_bytes()); // mod date
        self.data.extend_from_slice(&crc32.to_le_bytes());
        self.data.extend_from_slice(&compressed_size.to_le_bytes());
        self.data.extend_from_slice(&uncompressed_size.to_le_bytes());
        self.data
            .extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.data
            .extend_from_slice(&(extra.len() as u16).to_le_bytes());
        self.data.extend_from_slice(name.as_bytes());
        self.data.extend_from_slice(extra);
        (header_offset, self.data.len() as u64)
    }

    fn push_record(
        &mut self,
        name: &str,
        version_made_by: u16,
        version_needed: u16,
        flags: u16,
        method: u16,
        crc32: u32,
        compressed_size: u32,
        uncompressed_size: u32,
        external_attrs: u32,
        header_offset: u64,
        extra: Vec<u8>,
    ) {
        self.records.push(CdRecord {
            version_made_by,
            version_needed,
            flags,
            method,
            mod_time: 0x5462,
            mod_date: 0x58a1,
            crc32,
            compressed_size,
            uncompressed_size,
            external_attrs,
            header_offset: header_offset as u32,
            name: name.as_bytes().to_vec(),
            extra,
            comment: Vec::new(),
        });
    }

    fn remember(&mut self, name: &str, header_offset: u64, data_offset: u64, compressed: u64) {
        self.built.push(BuiltEntry {
            name: name.to_owned(),
            header_offset,
            data_offset,
            compressed_size: compressed,
        });
    }

    pub fn add_stored(&mut self, name: &str, content: &[u8]) -> &mut Self {
        let crc = crc32fast::hash(content);
        let len = content.len() as u32;
        let (header, data_offset) = self.push_local(name, 0, 0, crc, len, len, &[]);
        self.data.extend_from_slice(content);
        self.push_record(name, 20, 20, 0, 0, crc, len, len, 0, header, Vec::new());
        self.remember(name, header, data_offset, len as u64);
        self
    }

    /// A stored entry with caller-chosen general purpose flags, for
    /// exercising flag-driven rejections.
    pub fn add_stored_with_flags(&mut self, name: &str, content: &[u8], flags: u16) -> &mut Self {
        let crc = crc32fast::hash(content);
        let len = content.len() as u32;
        let (header, data_offset) = self.push_local(name, flags, 0, crc, len, len, &[]);
        self.data.extend_from_slice(content);
        self.push_record(name, 20, 20, flags, 0, crc, len, len, 0, header, Vec::new());
        self.remember(name, header, data_offset, len as u64);
        self
    }

    pub fn add_deflated(&mut self, name: &str, content: &[u8]) -> &mut Self {
        let crc = crc32fast::hash(content);
        let compressed = deflate(content);
        let (header, data_offset) = self.push_local(
            name,
            0,
            8,
            crc,
            compressed.len() as u32,
            content.len() as u32,
            &[],
        );
        self.data.extend_from_slice(&compressed);
        self.push_record(
            name,
            20,
            20,
            0,
            8,
            crc,
            compressed.len() as u32,
            content.len() as u32,
            0,
            header,
            Vec::new(),
        );
        self.remember(name, header, data_offset, compressed.len() as u64);
        self
    }

    pub fn add_dir(&mut self, name: &str) -> &mut Self {
        assert!(name.ends_with('/'));
        let (header, data_offset) = self.push_local(name, 0, 0, 0, 0, 0, &[]);
        self.push_record(name, 20, 20, 0, 0, 0, 0, 0, 0x10, header, Vec::new());
        self.remember(name, header, data_offset, 0);
        self
    }

    /// A stored entry with the traditional-encryption bit: 12 header
    /// bytes plus the "ciphertext".
    pub fn add_stored_encrypted(&mut self, name: &str, ciphertext: &[u8]) -> &mut Self {
        assert!(ciphertext.len() >= 12);
        let compressed = ciphertext.len() as u32;
        let uncompressed = compressed - 12;
        let (header, data_offset) =
            self.push_local(name, 1, 0, 0x12345678, compressed, uncompressed, &[]);
        self.data.extend_from_slice(ciphertext);
        self.push_record(
            name,
            20,
            20,
            1,
            0,
            0x12345678,
            compressed,
            uncompressed,
            0,
            header,
            Vec::new(),
        );
        self.remember(name, header, data_offset, compressed as u64);
        self
    }

    pub fn add_deflated_encrypted(&mut self, name: &str, ciphertext: &[u8]) -> &mut Self {
        let compressed = ciphertext.len() as u32;
        let (header, data_offset) =
            self.push_local(name, 1, 8, 0x12345678, compressed, 1000, &[]);
        self.data.extend_from_slice(ciphertext);
        self.push_record(
            name,
            20,
            20,
            1,
            8,
            0x12345678,
            compressed,
            1000,
            0,
            header,
            Vec::new(),
        );
        self.remember(name, header, data_offset, compressed as u64);
        self
    }

    /// An ordinary file the way the Archive Utility writes it: deflated,
    /// data descriptor, zeroed local sizes, one 22613 extra field.
    pub fn add_mac_file(&mut self, name: &str, content: &[u8]) -> &mut Self {
        let crc = crc32fast::hash(content);
        let compressed = deflate(content);
        let (header, data_offset) = self.push_local(name, 8, 8, 0, 0, 0, &mac_local_extra());
        self.data.extend_from_slice(&compressed);
        self.data.extend_from_slice(&DD_SIG.to_le_bytes());
        self.data.extend_from_slice(&crc.to_le_bytes());
        self.data
            .extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(content.len() as u32).to_le_bytes());
        self.push_record(
            name,
            MAC_VERSION_MADE_BY,
            20,
            8,
            8,
            crc,
            compressed.len() as u32,
            content.len() as u32,
            0o100644 << 16,
            header,
            mac_cd_extra(),
        );
        self.remember(name, header, data_offset, compressed.len() as u64);
        self
    }

    pub fn add_mac_dir(&mut self, name: &str) -> &mut Self {
        assert!(name.ends_with('/'));
        let (header, data_offset) = self.push_local(name, 0, 0, 0, 0, 0, &mac_local_extra());
        self.push_record(
            name,
            MAC_VERSION_MADE_BY,
            10,
            0,
            0,
            0,
            0,
            0,
            0o40755 << 16,
            header,
            mac_cd_extra(),
        );
        self.remember(name, header, data_offset, 0);
        self
    }

    pub fn add_mac_empty_file(&mut self, name: &str) -> &mut Self {
        let (header, data_offset) = self.push_local(name, 0, 0, 0, 0, 0, &mac_local_extra());
        self.push_record(
            name,
            MAC_VERSION_MADE_BY,
            10,
            0,
            0,
            0,
            0,
            0,
            0o100644 << 16,
            header,
            mac_cd_extra(),
        );
        self.remember(name, header, data_offset, 0);
        self
    }

    /// Symlinks are stored with their target as content and carry no
    /// extra fields at all.
    pub fn add_mac_symlink(&mut self, name: &str, target: &[u8]) -> &mut Self {
        let crc = crc32fast::hash(target);
        let len = target.len() as u32;
        let (header, data_offset) = self.push_local(name, 0, 0, 0, 0, 0, &[]);
        self.data.extend_from_slice(target);
        self.push_record(
            name,
            MAC_VERSION_MADE_BY,
            10,
            0,
            0,
            crc,
            len,
            len,
            0o120755 << 16,
            header,
            Vec::new(),
        );
        self.remember(name, header, data_offset, len as u64);
        self
    }

    /// Central directory record shaped exactly like the Archive
    /// Utility's, but with an honest Local File Header (real CRC and
    /// sizes, no extra field). Such an archive is indistinguishable from
    /// a Mac one until a stream validates the local header.
    pub fn add_fake_mac_file(&mut self, name: &str, content: &[u8]) -> &mut Self {
        let crc = crc32fast::hash(content);
        let compressed = deflate(content);
        let (header, data_offset) = self.push_local(
            name,
            8,
            8,
            crc,
            compressed.len() as u32,
            content.len() as u32,
            &[],
        );
        self.data.extend_from_slice(&compressed);
        self.push_record(
            name,
            MAC_VERSION_MADE_BY,
            20,
            8,
            8,
            crc,
            compressed.len() as u32,
            content.len() as u32,
            0o100644 << 16,
            header,
            mac_cd_extra(),
        );
        self.remember(name, header, data_offset, compressed.len() as u64);
        self
    }

    pub fn finish(self) -> Built {
        self.finish_with(None, b"")
    }

    /// `entry_count_override` writes a lying entry count into the EOCDR
    /// the way the Archive Utility's 2^16 truncation would.
    pub fn finish_with(self, entry_count_override: Option<u16>, comment: &[u8]) -> Built {
        let Builder {
            mut data,
            records,
            built,
        } = self;
        let cd_offset = data.len() as u64;

        for record in &records {
            data.extend_from_slice(&CDH_SIG.to_le_bytes());
            data.extend_from_slice(&record.version_made_by.to_le_bytes());
            data.extend_from_slice(&record.version_needed.to_le_bytes());
            data.extend_from_slice(&record.flags.to_le_bytes());
            data.extend_from_slice(&record.method.to_le_bytes());
            data.extend_from_slice(&record.mod_time.to_le_bytes());
            data.extend_from_slice(&record.mod_date.to_le_bytes());
            data.extend_from_slice(&record.crc32.to_le_bytes());
            data.extend_from_slice(&record.compressed_size.to_le_bytes());
            data.extend_from_slice(&record.uncompressed_size.to_le_bytes());
            data.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            data.extend_from_slice(&(record.extra.len() as u16).to_le_bytes());
            data.extend_from_slice(&(record.comment.len() as u16).to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes()); // disk number
            data.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            data.extend_from_slice(&record.external_attrs.to_le_bytes());
            data.extend_from_slice(&record.header_offset.to_le_bytes());
            data.extend_from_slice(&record.name);
            data.extend_from_slice(&record.extra);
            data.extend_from_slice(&record.comment);
        }

        let cd_size = data.len() as u64 - cd_offset;
        let entry_count =
            entry_count_override.unwrap_or_else(|| records.len().try_into().unwrap());

        data.extend_from_slice(&EOCDR_SIG.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // disk number
        data.extend_from_slice(&0u16.to_le_bytes()); // cd disk
        data.extend_from_slice(&entry_count.to_le_bytes());
        data.extend_from_slice(&entry_count.to_le_bytes());
        data.extend_from_slice(&(cd_size as u32).to_le_bytes());
        data.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        data.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        data.extend_from_slice(comment);

        Built {
            bytes: data,
            cd_offset,
            cd_size,
            entries: built,
        }
    }
}
