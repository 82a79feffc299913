//! Core data model: object and lease identifiers, access flags, summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult, ErrorKind};

/// Maximum length of an ObjectId in bytes.
pub const MAX_OBJECT_ID_LEN: usize = 256;

/// Opaque object identifier, unique per peer.
///
/// Typically a UUID or a content digest chosen by the creator. Uniqueness
/// across peers is not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Validates and wraps an object id.
    pub fn new(id: impl Into<String>) -> CacheResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CacheError::with_message(
                ErrorKind::Validation,
                "object id must not be empty",
            ));
        }
        if id.len() > MAX_OBJECT_ID_LEN {
            return Err(CacheError::with_message(
                ErrorKind::Validation,
                format!("object id exceeds {} bytes", MAX_OBJECT_ID_LEN),
            ));
        }
        Ok(Self(id))
    }

    /// Mints a random object id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque 128-bit lease identifier, minted by the lease store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> CacheResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CacheError::with_message(ErrorKind::Validation, "malformed lease id"))
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Access rights carried by a lease.
///
/// CREATE implies WRITE; READ is incompatible with CREATE on the same lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags {
    pub create: bool,
    pub read: bool,
    pub write: bool,
}

impl AccessFlags {
    pub const CREATE: AccessFlags = AccessFlags {
        create: true,
        read: false,
        write: true,
    };
    pub const READ: AccessFlags = AccessFlags {
        create: false,
        read: true,
        write: false,
    };

    /// Validates the combination and applies the CREATE ⇒ WRITE rule.
    pub fn normalized(mut self) -> CacheResult<Self> {
        if self.create {
            self.write = true;
        }
        if self.create && self.read {
            return Err(CacheError::with_message(
                ErrorKind::Validation,
                "READ is incompatible with CREATE on the same lease",
            ));
        }
        if !self.create && !self.read && !self.write {
            return Err(CacheError::with_message(
                ErrorKind::Validation,
                "at least one access flag is required",
            ));
        }
        Ok(self)
    }

    /// Flag names as they appear on the wire.
    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.create {
            out.push("CREATE");
        }
        if self.read {
            out.push("READ");
        }
        if self.write {
            out.push("WRITE");
        }
        out
    }

    /// Parses a wire flag list.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> CacheResult<Self> {
        let mut flags = AccessFlags::default();
        for name in names {
            match name.as_ref() {
                "CREATE" => flags.create = true,
                "READ" => flags.read = true,
                "WRITE" => flags.write = true,
                other => {
                    return Err(CacheError::with_message(
                        ErrorKind::Validation,
                        format!("unknown access flag {:?}", other),
                    ))
                }
            }
        }
        flags.normalized()
    }
}

/// The two object states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    Creating,
    Sealed,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Creating => "CREATING",
            ObjectState::Sealed => "SEALED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATING" => Some(ObjectState::Creating),
            "SEALED" => Some(ObjectState::Sealed),
            _ => None,
        }
    }
}

/// Blob backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    Mem,
    File,
    SharedFs,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Mem => "Mem",
            BlobKind::File => "File",
            BlobKind::SharedFs => "SharedFs",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Mem" => Some(BlobKind::Mem),
            "File" => Some(BlobKind::File),
            "SharedFs" => Some(BlobKind::SharedFs),
            _ => None,
        }
    }
}

/// Requested shape of a blob at CREATE time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSpec {
    pub kind: BlobKind,
    pub size: u64,
}

/// User metadata: a bag of string keys to opaque byte values.
pub type UserMeta = HashMap<String, Vec<u8>>;

/// Creation-time attributes supplied with `Acquire(CREATE)`.
#[derive(Debug, Clone, Default)]
pub struct AcquireMeta {
    pub blob_specs: Vec<BlobSpec>,
    pub user_meta: UserMeta,
    pub prev_objid: Option<ObjectId>,
}

/// A peer endpoint as understood by `connect` and the resolver.
pub type PeerEndpoint = String;

/// Immutable view of an object returned from peer operations.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub objid: ObjectId,
    pub state: ObjectState,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub user_meta: UserMeta,
    pub prev_objid: Option<ObjectId>,
}

/// Client-visible lease attributes.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub objid: ObjectId,
    pub flags: AccessFlags,
    pub issued_at: DateTime<Utc>,
    /// Wall-clock expiry for observability; `None` means explicit-release-only.
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseInfo {
    pub fn explicit_release_only(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Per-peer counters for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerStats {
    pub objects: u64,
    pub sealed_objects: u64,
    pub bytes_in_use: u64,
    pub live_leases: u64,
    pub evictions: u64,
    pub expired_leases: u64,
}
