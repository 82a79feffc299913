//! Blob on a shared (multi-host) filesystem.
//!
//! Layout per object: `<root>/<name>/` containing `header` and `data`.
//! The header is a fixed 128-byte record so that cross-process readers can
//! detect seal state without a peer round-trip.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, CacheResult, ErrorKind};

/// Fixed header length.
pub const SHARED_FS_HEADER_LEN: usize = 128;

/// Header magic.
const MAGIC: &[u8; 4] = b"PKCE";

/// Current header version.
const VERSION: u32 = 1;

/// Bit 0 of `flags`: set once the object is sealed.
const FLAG_SEALED: u32 = 1;

/// The on-disk header record. All integers little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedFsHeader {
    pub version: u32,
    pub flags: u32,
    pub size: u64,
    pub seal_ts_ms: u64,
}

impl SharedFsHeader {
    pub fn sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    pub fn encode(&self) -> [u8; SHARED_FS_HEADER_LEN] {
        let mut buf = [0u8; SHARED_FS_HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.seal_ts_ms.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> CacheResult<Self> {
        if buf.len() < SHARED_FS_HEADER_LEN || &buf[0..4] != MAGIC {
            return Err(CacheError::with_message(
                ErrorKind::Internal,
                "bad shared-fs header magic",
            ));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(CacheError::with_message(
                ErrorKind::Internal,
                format!("unsupported shared-fs header version {}", version),
            ));
        }
        Ok(Self {
            version,
            flags: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            seal_ts_ms: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        })
    }

    /// Reads the header of an object directory, for out-of-band seal checks.
    pub fn read_from(dir: &Path) -> CacheResult<Self> {
        let mut buf = [0u8; SHARED_FS_HEADER_LEN];
        let file = File::open(dir.join("header"))
            .map_err(|e| CacheError::internal(format!("open shared-fs header: {}", e)))?;
        file.read_exact_at(&mut buf, 0)?;
        Self::decode(&buf)
    }
}

/// A blob in a directory shared by multiple processes or hosts.
pub struct SharedFsBlob {
    dir: PathBuf,
    header_file: File,
    data_file: File,
}

impl SharedFsBlob {
    pub fn allocate(root: &Path, name: &str, size: u64) -> CacheResult<Self> {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| CacheError::internal(format!("create shared-fs dir: {}", e)))?;

        let header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("header"))
            .map_err(|e| CacheError::internal(format!("create shared-fs header: {}", e)))?;
        let header = SharedFsHeader {
            version: VERSION,
            flags: 0,
            size,
            seal_ts_ms: 0,
        };
        header_file.write_all_at(&header.encode(), 0)?;

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join("data"))
            .map_err(|e| CacheError::internal(format!("create shared-fs data: {}", e)))?;
        data_file
            .set_len(size)
            .map_err(|e| CacheError::internal(format!("shared-fs set_len: {}", e)))?;

        let dir = dir
            .canonicalize()
            .map_err(|e| CacheError::internal(format!("canonicalize shared-fs dir: {}", e)))?;
        Ok(Self {
            dir,
            header_file,
            data_file,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        self.data_file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.data_file.read_exact_at(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    /// Flushes the data file and rewrites the header with the seal flag set,
    /// holding a write lock on the header byte range for the duration.
    pub fn seal(&self, size: u64, seal_ts: DateTime<Utc>) -> CacheResult<()> {
        self.data_file.sync_all()?;

        let header = SharedFsHeader {
            version: VERSION,
            flags: FLAG_SEALED,
            size,
            seal_ts_ms: seal_ts.timestamp_millis().max(0) as u64,
        };

        lock_header_range(&self.header_file)?;
        let result = self
            .header_file
            .write_all_at(&header.encode(), 0)
            .and_then(|_| self.header_file.sync_all());
        unlock_header_range(&self.header_file);
        result.map_err(CacheError::from)
    }

    pub fn remove_dir(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::debug!("remove {} failed: {}", self.dir.display(), e);
        }
    }
}

fn lock_header_range(file: &File) -> CacheResult<()> {
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::fd::AsRawFd;

    let mut lk: nix::libc::flock = unsafe { std::mem::zeroed() };
    lk.l_type = nix::libc::F_WRLCK as _;
    lk.l_whence = nix::libc::SEEK_SET as _;
    lk.l_start = 0;
    lk.l_len = SHARED_FS_HEADER_LEN as _;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETLKW(&lk))
        .map_err(|e| CacheError::internal(format!("lock shared-fs header: {}", e)))?;
    Ok(())
}

fn unlock_header_range(file: &File) {
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::fd::AsRawFd;

    let mut lk: nix::libc::flock = unsafe { std::mem::zeroed() };
    lk.l_type = nix::libc::F_UNLCK as _;
    lk.l_whence = nix::libc::SEEK_SET as _;
    lk.l_start = 0;
    lk.l_len = SHARED_FS_HEADER_LEN as _;
    let _ = fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&lk));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encode_decode_round_trip() {
        let header = SharedFsHeader {
            version: VERSION,
            flags: FLAG_SEALED,
            size: 4096,
            seal_ts_ms: 1_700_000_000_000,
        };
        let decoded = SharedFsHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.sealed());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let buf = [0u8; SHARED_FS_HEADER_LEN];
        assert!(SharedFsHeader::decode(&buf).is_err());
    }

    #[test]
    fn seal_state_visible_through_header_file() {
        let root = tempfile::tempdir().unwrap();
        let blob = SharedFsBlob::allocate(root.path(), "obj-1", 3).unwrap();
        blob.write_at(0, b"abc").unwrap();

        let before = SharedFsHeader::read_from(blob.dir()).unwrap();
        assert!(!before.sealed());

        blob.seal(3, Utc::now()).unwrap();
        let after = SharedFsHeader::read_from(blob.dir()).unwrap();
        assert!(after.sealed());
        assert_eq!(after.size, 3);
    }
}
