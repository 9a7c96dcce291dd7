use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::Result;

/// Positioned read access to a raw device or disk image.
///
/// Every engine consumes this trait instead of `std::fs::File` so tests can
/// run against temp-file images. Reads past the end of the device return the
/// bytes that exist; only `read_exact_at` treats a short read as an error.
pub trait BlockReader {
    /// Reads up to `len` bytes at `offset`. The returned buffer is truncated
    /// at end-of-device and may be empty.
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Reads exactly `len` bytes at `offset` or fails.
    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buf = self.read_at(offset, len)?;
        if buf.len() < len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at offset {offset}: {} of {len} bytes", buf.len()),
            )
            .into());
        }
        Ok(buf)
    }

    /// Total byte length of the device or image.
    fn size(&self) -> u64;
}

/// File-backed reader for devices and image files, opened read-only.
pub struct DiskReader {
    file: File,
    size: u64,
}

impl DiskReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        // metadata().len() is 0 for block devices; seeking to the end works
        // for both devices and regular files.
        let size = file.seek(SeekFrom::End(0))?;
        tracing::debug!(path = %path.display(), size, "opened device");
        Ok(Self { file, size })
    }
}

impl BlockReader for DiskReader {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let len = len.min((self.size - offset) as usize);
        self.file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
