//! Unix-domain-socket transport adapter.
//!
//! Frames are 4-byte network-order length prefixes followed by JSON bodies
//! identical to the HTTP ones. `Acquire` responses for memory blobs carry
//! the blob's file descriptor in the ancillary `SCM_RIGHTS` payload, so the
//! client inherits a fresh descriptor onto the same memory object.
//!
//! Each connection is one logical session: requests are served strictly in
//! order, and every lease acquired on a connection is released when the
//! connection goes away.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use super::wire::{unescape_path, AcquireRequest, AcquireResponse};
use super::{ClientAcquired, ClientBlob, Transport};
use crate::error::{CacheError, CacheResult, ErrorEnvelope, ErrorKind};
use crate::model::{BlobKind, LeaseId, PeerStats};
use crate::peer::Peer;

/// Upper bound on a single frame body.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on descriptors attached to one response.
const MAX_FDS: usize = 16;

/// Client-side deadline for one request/response exchange.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum UdsRequest {
    Acquire {
        #[serde(flatten)]
        request: AcquireRequest,
    },
    Seal {
        lease_id: String,
    },
    Discard {
        lease_id: String,
    },
    Release {
        lease_id: String,
    },
    Stats,
}

fn send_frame(stream: &StdUnixStream, body: &[u8], fds: &[RawFd]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    if fds.is_empty() {
        return (&mut &*stream).write_all(&frame);
    }

    // The descriptors ride on the first segment of the frame; any remainder
    // after a short sendmsg goes out as plain writes.
    let iov = [IoSlice::new(&frame)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let mut written = sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(std::io::Error::from)?;
    while written < frame.len() {
        written += (&mut &*stream).write(&frame[written..])?;
    }
    Ok(())
}

/// Reads one frame. Returns `None` on clean EOF before any header byte.
/// Ancillary descriptors, if any, are delivered with the header bytes.
fn recv_frame(stream: &StdUnixStream) -> std::io::Result<Option<(Vec<u8>, Vec<OwnedFd>)>> {
    let mut header = [0u8; 4];
    let mut got = 0usize;
    let mut fds = Vec::new();

    while got < 4 {
        let mut iov = [IoSliceMut::new(&mut header[got..])];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);
        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(std::io::Error::from)?;

        if msg.bytes == 0 {
            if got == 0 && fds.is_empty() {
                return Ok(None);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    fds.extend(
                        raw.into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                    );
                }
            }
        }
        got += msg.bytes;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut body = vec![0u8; len];
    (&mut &*stream).read_exact(&mut body)?;
    Ok(Some((body, fds)))
}

/// UDS server hosting a peer on a socket path.
pub struct UdsServer {
    peer: Arc<dyn Peer>,
    listener: UnixListener,
    path: PathBuf,
}

impl UdsServer {
    /// Binds to `path`, clearing a stale socket file if no server answers.
    pub async fn bind(peer: Arc<dyn Peer>, path: impl Into<PathBuf>) -> CacheResult<Self> {
        let path = path.into();
        if path.exists() {
            // A live listener must not be unlinked out from under its
            // clients; only remove the file when nobody answers.
            if StdUnixStream::connect(&path).is_ok() {
                return Err(CacheError::with_message(
                    ErrorKind::Internal,
                    format!("{} already has a listener", path.display()),
                ));
            }
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| CacheError::internal(format!("bind {}: {}", path.display(), e)))?;
        info!("uds peer listening on {}", path.display());
        Ok(Self {
            peer,
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop. Each connection gets a dedicated session that serializes
    /// its requests.
    pub async fn run(self) -> CacheResult<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| CacheError::internal(format!("uds accept: {}", e)))?;
            let std_stream = stream
                .into_std()
                .map_err(|e| CacheError::internal(format!("uds stream: {}", e)))?;
            std_stream
                .set_nonblocking(false)
                .map_err(|e| CacheError::internal(format!("uds stream: {}", e)))?;

            let peer = self.peer.clone();
            let handle = tokio::runtime::Handle::current();
            tokio::task::spawn_blocking(move || session(std_stream, peer, handle));
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<CacheResult<()>> {
        tokio::spawn(self.run())
    }
}

impl Drop for UdsServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn session(stream: StdUnixStream, peer: Arc<dyn Peer>, handle: tokio::runtime::Handle) {
    let mut held: Vec<LeaseId> = Vec::new();

    loop {
        let (body, _fds) = match recv_frame(&stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                debug!("uds session read error: {}", err);
                break;
            }
        };

        let (response, fds) = handle_frame(&body, &peer, &handle, &mut held);
        let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        if let Err(err) = send_frame(&stream, &response, &raw_fds) {
            debug!("uds session write error: {}", err);
            break;
        }
        // Our duplicates close here; the client keeps its received copies.
    }

    // Connection loss counts as release for every lease acquired on it.
    for lease_id in held {
        if let Err(err) = handle.block_on(peer.release(lease_id)) {
            if err.kind != ErrorKind::InvalidLease {
                warn!("release on disconnect failed for {}: {}", lease_id, err);
            }
        }
    }
}

fn error_frame(err: &CacheError) -> Vec<u8> {
    serde_json::to_vec(&ErrorEnvelope::from_error(err)).unwrap_or_default()
}

fn handle_frame(
    body: &[u8],
    peer: &Arc<dyn Peer>,
    handle: &tokio::runtime::Handle,
    held: &mut Vec<LeaseId>,
) -> (Vec<u8>, Vec<OwnedFd>) {
    let request: UdsRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            let err = CacheError::with_message(ErrorKind::Validation, err.to_string());
            return (error_frame(&err), Vec::new());
        }
    };

    match request {
        UdsRequest::Acquire { request } => {
            let parts = match request.into_parts() {
                Ok(parts) => parts,
                Err(err) => return (error_frame(&err), Vec::new()),
            };
            let (objid, flags, meta, ttl) = parts;
            match handle.block_on(peer.acquire(objid, flags, meta, ttl)) {
                Ok(acquired) => match AcquireResponse::from_acquired(&acquired, true) {
                    Ok((response, fds)) => {
                        held.push(acquired.lease.id);
                        (serde_json::to_vec(&response).unwrap_or_default(), fds)
                    }
                    Err(err) => (error_frame(&err), Vec::new()),
                },
                Err(err) => (error_frame(&err), Vec::new()),
            }
        }
        UdsRequest::Seal { lease_id } => {
            lease_frame(&lease_id, |id| handle.block_on(peer.seal(id)))
        }
        UdsRequest::Discard { lease_id } => lease_frame(&lease_id, |id| {
            let result = handle.block_on(peer.discard(id));
            if result.is_ok() {
                held.retain(|h| *h != id);
            }
            result
        }),
        UdsRequest::Release { lease_id } => lease_frame(&lease_id, |id| {
            let result = handle.block_on(peer.release(id));
            if result.is_ok() {
                held.retain(|h| *h != id);
            }
            result
        }),
        UdsRequest::Stats => {
            let stats = handle.block_on(peer.stats());
            (serde_json::to_vec(&stats).unwrap_or_default(), Vec::new())
        }
    }
}

fn lease_frame(
    lease_id: &str,
    f: impl FnOnce(LeaseId) -> CacheResult<()>,
) -> (Vec<u8>, Vec<OwnedFd>) {
    let result = LeaseId::parse(lease_id).and_then(f);
    let body = match result {
        Ok(()) => serde_json::to_vec(&serde_json::json!({ "ok": true })).unwrap_or_default(),
        Err(err) => error_frame(&err),
    };
    (body, Vec::new())
}

/// UDS client side of the adapter.
pub struct UdsTransport {
    stream: Arc<Mutex<StdUnixStream>>,
}

impl UdsTransport {
    pub async fn connect(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::task::spawn_blocking(move || StdUnixStream::connect(&path))
            .await
            .map_err(CacheError::internal)?
            .map_err(CacheError::transport)?;
        // Client-side deadline; the lease TTL is the server-side backstop.
        stream
            .set_read_timeout(Some(REQUEST_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(REQUEST_TIMEOUT)))
            .map_err(CacheError::transport)?;
        Ok(Self {
            stream: Arc::new(Mutex::new(stream)),
        })
    }

    async fn call(&self, request: UdsRequest) -> CacheResult<(serde_json::Value, Vec<OwnedFd>)> {
        let body = serde_json::to_vec(&request).map_err(CacheError::internal)?;
        let stream = self.stream.clone();

        let (response, fds) = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let stream = stream.lock();
            send_frame(&stream, &body, &[])?;
            recv_frame(&stream)?.ok_or_else(|| std::io::ErrorKind::UnexpectedEof.into())
        })
        .await
        .map_err(CacheError::internal)?
        .map_err(CacheError::transport)?;

        let value: serde_json::Value =
            serde_json::from_slice(&response).map_err(CacheError::transport)?;
        if value.get("error").is_some() {
            let envelope: ErrorEnvelope =
                serde_json::from_value(value).map_err(CacheError::transport)?;
            return Err(envelope.into_error());
        }
        Ok((value, fds))
    }
}

#[async_trait]
impl Transport for UdsTransport {
    async fn acquire(&self, request: AcquireRequest) -> CacheResult<ClientAcquired> {
        let (value, fds) = self.call(UdsRequest::Acquire { request }).await?;
        let response: AcquireResponse =
            serde_json::from_value(value).map_err(CacheError::transport)?;
        let lease_id = response.lease_id()?;
        let object = response.object.into_summary()?;

        let mut fd_slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let mut blobs = Vec::with_capacity(response.blobs.len());
        for blob in response.blobs {
            let kind = BlobKind::from_str(&blob.kind).ok_or_else(|| {
                CacheError::with_message(
                    ErrorKind::TransportError,
                    format!("unknown blob kind {:?}", blob.kind),
                )
            })?;
            let client_blob = if let Some(index) = blob.fd_index {
                let fd = fd_slots
                    .get_mut(index as usize)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        CacheError::with_message(
                            ErrorKind::TransportError,
                            format!("missing ancillary descriptor {}", index),
                        )
                    })?;
                ClientBlob::from_fd(kind, blob.size, std::fs::File::from(fd))
            } else if let Some(handle) = blob.handle {
                ClientBlob::from_path(kind, blob.size, unescape_path(&handle)?)
            } else {
                ClientBlob::opaque(kind, blob.size)
            };
            blobs.push(client_blob);
        }

        Ok(ClientAcquired {
            lease_id,
            object,
            blobs,
        })
    }

    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()> {
        self.call(UdsRequest::Seal {
            lease_id: lease_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()> {
        self.call(UdsRequest::Discard {
            lease_id: lease_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn release(&self, lease_id: LeaseId) -> CacheResult<()> {
        self.call(UdsRequest::Release {
            lease_id: lease_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn stats(&self) -> CacheResult<PeerStats> {
        let (value, _) = self.call(UdsRequest::Stats).await?;
        serde_json::from_value(value).map_err(CacheError::transport)
    }
}
