//! JSON wire messages shared by the HTTP and UDS adapters.
//!
//! Unknown fields are ignored on decode for forward compatibility. User
//! metadata values are opaque bytes and cross the wire base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::time::Duration;

use crate::blob::BlobHandle;
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::model::{
    AccessFlags, AcquireMeta, BlobKind, BlobSpec, LeaseId, ObjectId, ObjectState, ObjectSummary,
    UserMeta,
};
use crate::peer::Acquired;

/// `POST /acquire` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub objid: String,
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<WireMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blob_specs: Vec<WireBlobSpec>,
}

/// User metadata and chain link carried on CREATE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireMeta {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_objid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBlobSpec {
    pub kind: String,
    pub size: u64,
}

/// `POST /seal`, `/discard`, `/release` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub lease_id: String,
}

/// Success body for lease operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// `POST /acquire` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub lease_id: String,
    pub object: WireObject,
    pub blobs: Vec<WireBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireObject {
    pub objid: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_ts: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_objid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBlob {
    pub kind: String,
    pub size: u64,
    /// URL-escaped path for path-style access; absent for memory blobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Position of this blob's descriptor in the UDS ancillary payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd_index: Option<u32>,
}

impl AcquireRequest {
    /// Request that creates `objid` with the given blob shapes.
    pub fn create(objid: &ObjectId, meta: &AcquireMeta, ttl: Option<Duration>) -> Self {
        Self {
            objid: objid.to_string(),
            flags: vec!["CREATE".to_string()],
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            meta: Some(WireMeta {
                user: encode_meta(&meta.user_meta),
                prev_objid: meta.prev_objid.as_ref().map(|p| p.to_string()),
            }),
            blob_specs: meta
                .blob_specs
                .iter()
                .map(|s| WireBlobSpec {
                    kind: s.kind.as_str().to_string(),
                    size: s.size,
                })
                .collect(),
        }
    }

    /// Request that opens `objid` for reading.
    pub fn read(objid: &ObjectId, ttl: Option<Duration>) -> Self {
        Self {
            objid: objid.to_string(),
            flags: vec!["READ".to_string()],
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            meta: None,
            blob_specs: Vec::new(),
        }
    }

    /// Decodes the wire request into peer-native arguments.
    pub fn into_parts(
        self,
    ) -> CacheResult<(ObjectId, AccessFlags, Option<AcquireMeta>, Option<Duration>)> {
        let objid = ObjectId::new(self.objid)?;
        let flags = AccessFlags::from_names(&self.flags)?;
        let ttl = self.ttl_ms.map(Duration::from_millis);

        let meta = if flags.create {
            let wire_meta = self.meta.unwrap_or_default();
            let mut blob_specs = Vec::with_capacity(self.blob_specs.len());
            for spec in self.blob_specs {
                let kind = BlobKind::from_str(&spec.kind).ok_or_else(|| {
                    CacheError::with_message(
                        ErrorKind::Validation,
                        format!("unknown blob kind {:?}", spec.kind),
                    )
                })?;
                blob_specs.push(BlobSpec {
                    kind,
                    size: spec.size,
                });
            }
            let prev_objid = wire_meta
                .prev_objid
                .map(ObjectId::new)
                .transpose()?;
            Some(AcquireMeta {
                blob_specs,
                user_meta: decode_meta(&wire_meta.user)?,
                prev_objid,
            })
        } else {
            None
        };

        Ok((objid, flags, meta, ttl))
    }
}

impl WireObject {
    pub fn from_summary(summary: &ObjectSummary) -> Self {
        Self {
            objid: summary.objid.to_string(),
            state: summary.state.as_str().to_string(),
            seal_ts: summary
                .sealed_at
                .map(|ts| ts.timestamp_millis().max(0) as u64),
            meta: encode_meta(&summary.user_meta),
            prev_objid: summary.prev_objid.as_ref().map(|p| p.to_string()),
        }
    }

    pub fn into_summary(self) -> CacheResult<ObjectSummary> {
        let state = ObjectState::from_str(&self.state).ok_or_else(|| {
            CacheError::with_message(
                ErrorKind::TransportError,
                format!("unknown object state {:?}", self.state),
            )
        })?;
        Ok(ObjectSummary {
            objid: ObjectId::new(self.objid)?,
            state,
            created_at: Utc::now(),
            sealed_at: self
                .seal_ts
                .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()),
            user_meta: decode_meta(&self.meta)?,
            prev_objid: self.prev_objid.map(ObjectId::new).transpose()?,
        })
    }
}

impl AcquireResponse {
    /// Builds the wire response by exporting each blob's handle.
    ///
    /// Descriptor handles become ancillary payload positions when the
    /// transport passes fds (UDS); a transport that cannot carry them
    /// (HTTP) leaves those blobs without a handle. Path handles are
    /// URL-escaped. The returned descriptors are sent alongside the
    /// response, in `fd_index` order.
    pub fn from_acquired(
        acquired: &Acquired,
        with_fd_passing: bool,
    ) -> CacheResult<(Self, Vec<OwnedFd>)> {
        let mut fds = Vec::new();
        let mut blobs = Vec::with_capacity(acquired.blobs.len());
        for blob in &acquired.blobs {
            let (handle, fd_index) = match blob.export_handle()? {
                BlobHandle::Fd(fd) if with_fd_passing => {
                    let index = fds.len() as u32;
                    fds.push(fd);
                    (None, Some(index))
                }
                BlobHandle::Fd(_) => (None, None),
                BlobHandle::Path(path) => (Some(escape_path(&path)), None),
                BlobHandle::SharedDir(dir) => (Some(escape_path(&dir)), None),
            };
            blobs.push(WireBlob {
                kind: blob.kind().as_str().to_string(),
                size: blob.size(),
                handle,
                fd_index,
            });
        }

        let response = Self {
            lease_id: acquired.lease.id.to_string(),
            object: WireObject::from_summary(&acquired.object),
            blobs,
            lease_expires_ms: acquired
                .lease
                .expires_at
                .map(|ts| ts.timestamp_millis().max(0) as u64),
        };
        Ok((response, fds))
    }

    pub fn lease_id(&self) -> CacheResult<LeaseId> {
        LeaseId::parse(&self.lease_id)
    }
}

pub fn encode_meta(meta: &UserMeta) -> HashMap<String, String> {
    meta.iter()
        .map(|(k, v)| (k.clone(), BASE64.encode(v)))
        .collect()
}

pub fn decode_meta(wire: &HashMap<String, String>) -> CacheResult<UserMeta> {
    wire.iter()
        .map(|(k, v)| {
            BASE64
                .decode(v)
                .map(|bytes| (k.clone(), bytes))
                .map_err(|_| {
                    CacheError::with_message(
                        ErrorKind::Validation,
                        format!("metadata value for {:?} is not base64", k),
                    )
                })
        })
        .collect()
}

/// URL-escapes a filesystem path for use as a wire handle.
pub fn escape_path(path: &std::path::Path) -> String {
    percent_encoding::utf8_percent_encode(
        &path.to_string_lossy(),
        percent_encoding::NON_ALPHANUMERIC,
    )
    .to_string()
}

/// Reverses [`escape_path`].
pub fn unescape_path(handle: &str) -> CacheResult<std::path::PathBuf> {
    percent_encoding::percent_decode_str(handle)
        .decode_utf8()
        .map(|s| std::path::PathBuf::from(s.into_owned()))
        .map_err(|_| CacheError::with_message(ErrorKind::TransportError, "malformed handle"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_request_round_trips_create() {
        let objid = ObjectId::new("obj-1").unwrap();
        let meta = AcquireMeta {
            blob_specs: vec![BlobSpec {
                kind: BlobKind::Mem,
                size: 11,
            }],
            user_meta: HashMap::from([("origin".to_string(), b"unit".to_vec())]),
            prev_objid: None,
        };
        let req = AcquireRequest::create(&objid, &meta, Some(Duration::from_secs(5)));
        let json = serde_json::to_string(&req).unwrap();
        let parsed: AcquireRequest = serde_json::from_str(&json).unwrap();
        let (objid2, flags, meta2, ttl) = parsed.into_parts().unwrap();

        assert_eq!(objid2, objid);
        assert!(flags.create && flags.write && !flags.read);
        let meta2 = meta2.unwrap();
        assert_eq!(meta2.blob_specs.len(), 1);
        assert_eq!(meta2.user_meta.get("origin").unwrap(), b"unit");
        assert_eq!(ttl, Some(Duration::from_secs(5)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{"objid":"k","flags":["READ"],"future_field":42}"#;
        let parsed: AcquireRequest = serde_json::from_str(json).unwrap();
        let (_, flags, meta, _) = parsed.into_parts().unwrap();
        assert!(flags.read);
        assert!(meta.is_none());
    }

    #[test]
    fn path_handles_round_trip() {
        let path = std::path::Path::new("/tmp/packice/obj with space");
        let escaped = escape_path(path);
        assert!(!escaped.contains(' '));
        assert_eq!(unescape_path(&escaped).unwrap(), path);
    }
}
