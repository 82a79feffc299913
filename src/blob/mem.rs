//! Anonymous shared-memory blob backed by a memfd.

use bytes::Bytes;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;

use crate::error::{CacheError, CacheResult, ErrorKind};

/// A blob held in an anonymous memory file.
///
/// On Linux the region is a `memfd_create` descriptor; elsewhere (or if the
/// syscall is unavailable) an immediately-unlinked temporary file stands in.
/// Either way the exported handle is a plain file descriptor and readers can
/// memory-map it for zero-copy access.
pub struct MemBlob {
    file: File,
}

impl MemBlob {
    pub fn allocate(name: &str, size: u64) -> CacheResult<Self> {
        let file = create_anon_file(name)?;
        file.set_len(size)
            .map_err(|e| CacheError::internal(format!("memfd set_len: {}", e)))?;
        Ok(Self { file })
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
        self.file.sync_data()?;
        Ok(())
    }

    /// Duplicates the backing descriptor for export to a client. Receivers
    /// can memory-map the descriptor for zero-copy reads.
    pub fn dup_fd(&self) -> CacheResult<OwnedFd> {
        let dup = self
            .file
            .try_clone()
            .map_err(|e| CacheError::internal(format!("dup memfd: {}", e)))?;
        Ok(OwnedFd::from(dup))
    }
}

#[cfg(target_os = "linux")]
fn create_anon_file(name: &str) -> CacheResult<File> {
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use std::ffi::CString;

    let cname = CString::new(name.as_bytes())
        .map_err(|_| CacheError::with_message(ErrorKind::Validation, "NUL in blob name"))?;
    match memfd_create(&cname, MemFdCreateFlag::MFD_CLOEXEC) {
        Ok(fd) => Ok(File::from(fd)),
        // ENOSYS on exotic kernels: fall back to an unlinked temp file.
        Err(nix::errno::Errno::ENOSYS) => anon_tempfile(),
        Err(e) => Err(CacheError::internal(format!("memfd_create: {}", e))),
    }
}

#[cfg(not(target_os = "linux"))]
fn create_anon_file(_name: &str) -> CacheResult<File> {
    anon_tempfile()
}

fn anon_tempfile() -> CacheResult<File> {
    tempfile::tempfile().map_err(|e| CacheError::internal(format!("anon tempfile: {}", e)))
}
