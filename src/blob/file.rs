//! Regular-file blob on a local filesystem.

use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, CacheResult};

/// A blob stored as one regular file. The absolute path is the handle;
/// a descriptor can also be exported on request.
pub struct FileBlob {
    path: PathBuf,
    file: File,
}

impl FileBlob {
    pub fn allocate(data_dir: &Path, name: &str, size: u64) -> CacheResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| CacheError::internal(format!("create data dir: {}", e)))?;
        let path = data_dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| CacheError::internal(format!("create blob file: {}", e)))?;
        file.set_len(size)
            .map_err(|e| CacheError::internal(format!("blob set_len: {}", e)))?;
        let path = path
            .canonicalize()
            .map_err(|e| CacheError::internal(format!("canonicalize blob path: {}", e)))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    pub fn flush(&self) -> CacheResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Removes the file. Open descriptors keep their bytes.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("unlink {} failed: {}", self.path.display(), e);
        }
    }
}
