//! Lazy, streaming ZIP archive reading.
//!
//! An archive is never held in memory or extracted to disk: callers
//! iterate entries one at a time and stream each entry's decompressed
//! contents through a backpressure-preserving `AsyncRead`. Three
//! overlapping dialects are parsed by one adaptive directory locator:
//!
//! 1. the original PKZIP layout,
//! 2. the ZIP64 extension for archives past the 32-bit limits,
//! 3. the Mac OS Archive Utility dialect, which silently truncates
//!    sizes, offsets and entry counts modulo 2^32 / 2^16 instead of
//!    using ZIP64.
//!
//! Mac recovery is evidence-driven: an archive starts out
//! spec-compliant or "maybe Mac", and individual entries, local
//! headers, data descriptors and even inflation byte counts promote or
//! demote that verdict. A spec-compliant archive is never mis-parsed as
//! a Mac archive.
//!
//! ```no_run
//! use futures_util::TryStreamExt;
//!
//! # async fn run() -> lazyzip::ZipResult<()> {
//! let archive = lazyzip::ZipArchive::open("example.zip", Default::default()).await?;
//! let mut entries = std::pin::pin!(archive.entries());
//! while let Some(entry) = entries.try_next().await? {
//!     println!("{:>9} {}", entry.uncompressed_size(), entry.file_name().unwrap());
//! }
//! archive.close().await
//! # }
//! ```

mod combinators;
mod cp437;
mod crc32;
mod mac;
mod spec;

pub mod compression;
pub mod extra_fields;
pub mod read;
pub mod reader;
pub mod result;
pub mod types;
pub mod util;

pub use crate::combinators::EntryStream;
pub use crate::compression::CompressionMethod;
pub use crate::extra_fields::ExtraField;
pub use crate::read::{OpenOptions, StreamOptions, ZipArchive};
pub use crate::reader::{BufferReader, FileReader, ReadAt};
pub use crate::result::{ZipError, ZipResult};
pub use crate::types::{DateTime, System, ZipEntry};

#[cfg(unix)]
pub use crate::reader::FdReader;
