#![forbid(unsafe_code)]
//! Byte-addressed read access to XFS images.
//!
//! Provides the `ByteDevice` trait with pread-style fixed-offset reads, a
//! file/block-device backed implementation and an in-memory one. Nothing in
//! here writes.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use xfv_error::{Result, XfvError};

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// Fails with `XfvError::ShortRead` when the range extends past the end
    /// of the device.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh buffer.
    fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Bounds check shared by every device: `offset + len` must fit the device.
fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let needed = u64::try_from(len)
        .map_err(|_| XfvError::InvalidGeometry("read length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(needed)
        .ok_or_else(|| XfvError::InvalidGeometry(format!("read range at {offset} overflows u64")))?;
    if end > device_len {
        return Err(XfvError::ShortRead {
            offset,
            needed,
            available: device_len,
        });
    }
    Ok(())
}

/// File-backed byte device.
///
/// Works for both regular image files and block device nodes. Block devices
/// report a zero metadata length, so their size comes from seeking to the end.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        let metadata = file.metadata()?;
        let len = if metadata.file_type().is_block_device() {
            (&file).seek(SeekFrom::End(0))?
        } else {
            metadata.len()
        };
        debug!(path = %path.display(), len, "opened byte device");
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device, for tests and for images already loaded into RAM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryByteDevice {
    bytes: Vec<u8>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// A zero-filled device of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    /// Overwrite `data.len()` bytes at `offset`, growing the device if needed.
    ///
    /// Only used to build images; the `ByteDevice` surface stays read-only.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(data);
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        // In range of a Vec, so the offset fits usize.
        let start = usize::try_from(offset)
            .map_err(|_| XfvError::InvalidGeometry(format!("offset {offset} overflows usize")))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for &D {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}
