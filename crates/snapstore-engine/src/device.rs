//! Whole-block device I/O
//!
//! Thin wrapper over a file or block device. All transfers are issued
//! at explicit byte offsets; callers only ever move whole metadata
//! blocks or whole chunks.

use snapstore_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// An open origin or snapshot-store device.
pub struct BlockDevice {
    file: File,
    path: String,
    size: u64,
}

impl BlockDevice {
    /// Open an existing file or block device for read/write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {path_str}: {e}")))?;
        let size = Self::probe_size(&file, &path_str)?;
        Ok(Self {
            file,
            path: path_str,
            size,
        })
    }

    /// Create a regular file of the given size, or open a block device
    /// (whose size is taken from the device itself).
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;

        let actual_size = if is_block_device {
            Self::block_device_size(&file, &path_str)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::Storage(format!("failed to size {path_str}: {e}")))?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
        })
    }

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path).is_ok_and(|m| m.file_type().is_block_device())
    }

    fn probe_size(file: &File, path: &str) -> Result<u64> {
        let metadata = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to stat {path}: {e}")))?;
        use std::os::unix::fs::FileTypeExt;
        if metadata.file_type().is_block_device() {
            Self::block_device_size(file, path)
        } else {
            Ok(metadata.len())
        }
    }

    /// Get a block device's size via the `BLKGETSIZE64` ioctl.
    #[cfg(target_os = "linux")]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        #[allow(unsafe_code)]
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
        if ret == -1 {
            return Err(Error::Storage(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| Error::Storage(format!("failed to get device size for {path}: {e}")))
    }

    /// Device size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device path, for diagnostics.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read exactly `buf.len()` bytes at the given byte offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write all of `buf` at the given byte offset.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Flush written data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
