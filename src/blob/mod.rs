//! Blob backends: byte containers with exportable handles.
//!
//! A blob is the data-plane unit of storage. The peer hands out handles
//! (file descriptors or paths) so that bytes flow directly between the
//! client and the backing store without passing through the peer.

mod file;
mod mem;
mod shared_fs;

pub use file::FileBlob;
pub use mem::MemBlob;
pub use shared_fs::{SharedFsBlob, SharedFsHeader, SHARED_FS_HEADER_LEN};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::model::{BlobKind, BlobSpec};

/// Exportable reference to a blob's bytes.
#[derive(Debug)]
pub enum BlobHandle {
    /// A duplicated file descriptor referring to the backing memory object.
    Fd(OwnedFd),
    /// Absolute path of a regular file.
    Path(PathBuf),
    /// Directory of a shared-filesystem object (`header` + `data` inside).
    SharedDir(PathBuf),
}

/// The backend variants. A closed set so error paths can match exhaustively.
enum Backend {
    Mem(MemBlob),
    File(FileBlob),
    SharedFs(SharedFsBlob),
}

/// A byte container with seal-once semantics.
///
/// Writes are rejected after seal with `SealViolation`; every operation is
/// rejected after destruction with `Gone`.
pub struct Blob {
    kind: BlobKind,
    size: u64,
    sealed: AtomicBool,
    gone: AtomicBool,
    backend: Backend,
}

impl Blob {
    /// Allocates a blob per the given spec.
    ///
    /// `data_dir` is the backing directory for `File` and `SharedFs` blobs;
    /// `name` scopes on-disk artifacts to the owning object.
    pub fn allocate(spec: BlobSpec, data_dir: &std::path::Path, name: &str) -> CacheResult<Self> {
        let backend = match spec.kind {
            BlobKind::Mem => Backend::Mem(MemBlob::allocate(name, spec.size)?),
            BlobKind::File => Backend::File(FileBlob::allocate(data_dir, name, spec.size)?),
            BlobKind::SharedFs => {
                Backend::SharedFs(SharedFsBlob::allocate(data_dir, name, spec.size)?)
            }
        };
        Ok(Self {
            kind: spec.kind,
            size: spec.size,
            sealed: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            backend,
        })
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn check_live(&self) -> CacheResult<()> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(CacheError::new(ErrorKind::Gone));
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> CacheResult<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(CacheError::with_message(
                ErrorKind::Validation,
                format!(
                    "range {}..{} exceeds blob size {}",
                    offset,
                    offset.saturating_add(len),
                    self.size
                ),
            ));
        }
        Ok(())
    }

    /// Writes `data` at `offset`. Fails with `SealViolation` once sealed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        self.check_live()?;
        if self.is_sealed() {
            return Err(CacheError::new(ErrorKind::SealViolation));
        }
        self.check_range(offset, data.len() as u64)?;
        match &self.backend {
            Backend::Mem(b) => b.write_at(offset, data),
            Backend::File(b) => b.write_at(offset, data),
            Backend::SharedFs(b) => b.write_at(offset, data),
        }
    }

    /// Reads `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        self.check_live()?;
        self.check_range(offset, len)?;
        match &self.backend {
            Backend::Mem(b) => b.read_at(offset, len),
            Backend::File(b) => b.read_at(offset, len),
            Backend::SharedFs(b) => b.read_at(offset, len),
        }
    }

    /// Reads the whole blob.
    pub fn read_all(&self) -> CacheResult<Bytes> {
        self.read_at(0, self.size)
    }

    /// Flushes writes and freezes the bytes. Idempotent.
    pub fn seal(&self, seal_ts: DateTime<Utc>) -> CacheResult<()> {
        self.check_live()?;
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.backend {
            Backend::Mem(b) => b.flush(),
            Backend::File(b) => b.flush(),
            Backend::SharedFs(b) => b.seal(self.size, seal_ts),
        }
    }

    /// Exports the backend handle for direct client I/O.
    pub fn export_handle(&self) -> CacheResult<BlobHandle> {
        self.check_live()?;
        match &self.backend {
            Backend::Mem(b) => Ok(BlobHandle::Fd(b.dup_fd()?)),
            Backend::File(b) => Ok(BlobHandle::Path(b.path().to_path_buf())),
            Backend::SharedFs(b) => Ok(BlobHandle::SharedDir(b.dir().to_path_buf())),
        }
    }

    /// Tears down on-disk artifacts and invalidates future handle exports.
    ///
    /// Already-exported descriptors stay readable: unlinked files keep their
    /// bytes for open descriptors, which is what keeps live leases valid.
    pub fn destroy(&self) {
        if self.gone.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            Backend::Mem(_) => {}
            Backend::File(b) => b.unlink(),
            Backend::SharedFs(b) => b.remove_dir(),
        }
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("sealed", &self.is_sealed())
            .field("gone", &self.gone.load(Ordering::SeqCst))
            .finish()
    }
}
