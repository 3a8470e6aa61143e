//! Helpers for draining entry streams and validating file names.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::result::{ZipError, ZipResult};

/// Drain a stream into a byte vector.
pub async fn read_to_end<R: AsyncRead + Unpin>(mut stream: R) -> ZipResult<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}

/// Drain a stream into a UTF-8 string.
pub async fn read_to_string<R: AsyncRead + Unpin>(mut stream: R) -> ZipResult<String> {
    let mut out = String::new();
    stream.read_to_string(&mut out).await?;
    Ok(out)
}

/// Reject file names that could escape an extraction root.
///
/// It is dangerous to hand a ZIP-supplied name to the filesystem: it may
/// be absolute (`/etc/shadow`, `C:\boot.ini`) or traverse upward
/// (`../runtime`). Carelessly writing to such paths lets an attacker
/// craft an archive that overwrites critical files.
pub fn validate_file_name(name: &str) -> ZipResult<()> {
    if name.starts_with('/') {
        return Err(ZipError::InvalidArchive("Absolute path in filename"));
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(ZipError::InvalidArchive("Absolute path in filename"));
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err(ZipError::InvalidArchive("Relative path in filename"));
    }
    Ok(())
}

/// Backslashes are invalid in ZIP file names, but some writers emit them
/// anyway. By default they are mapped to forward slashes; in strict mode
/// they reject the entry.
pub(crate) fn apply_backslash_policy(name: String, strict: bool) -> ZipResult<String> {
    if !name.contains('\\') {
        return Ok(name);
    }
    if strict {
        return Err(ZipError::InvalidArchive("Invalid characters in filename"));
    }
    Ok(name.replace('\\', "/"))
}
