//! HTTP/1.1 transport adapter.
//!
//! Server: `POST /acquire`, `/seal`, `/discard`, `/release` plus
//! `GET /stats`, all JSON. Handles are path-style only; there is no fd
//! passing over HTTP. `Seal` and `Release` honor a client-supplied
//! `Idempotency-Key` header and deduplicate replays for 60 seconds.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::wire::{
    unescape_path, AcquireRequest, AcquireResponse, LeaseRequest, OkResponse,
};
use super::{ClientAcquired, ClientBlob, Transport};
use crate::error::{CacheError, CacheResult, ErrorEnvelope, ErrorKind};
use crate::model::{BlobKind, LeaseId, PeerStats};
use crate::peer::Peer;

/// How long a deduplicated idempotent response is remembered.
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(60);

/// Client-side deadline for one HTTP operation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the client-supplied idempotency key.
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
struct HttpState {
    peer: Arc<dyn Peer>,
    replays: Arc<DashMap<String, ReplayEntry>>,
}

struct ReplayEntry {
    at: Instant,
    ok: bool,
    body: String,
}

/// Builds the peer-facing router.
pub fn peer_router(peer: Arc<dyn Peer>) -> Router {
    let state = HttpState {
        peer,
        replays: Arc::new(DashMap::new()),
    };
    Router::new()
        .route("/acquire", post(acquire_handler))
        .route("/seal", post(seal_handler))
        .route("/discard", post(discard_handler))
        .route("/release", post(release_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn acquire_handler(
    State(state): State<HttpState>,
    Json(request): Json<AcquireRequest>,
) -> Response {
    let (objid, flags, meta, ttl) = match request.into_parts() {
        Ok(parts) => parts,
        Err(err) => return err.into_response(),
    };
    match state.peer.acquire(objid, flags, meta, ttl).await {
        // HTTP cannot carry descriptors, so fd handles are dropped here.
        Ok(acquired) => match AcquireResponse::from_acquired(&acquired, false) {
            Ok((response, _fds)) => Json(response).into_response(),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn seal_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<LeaseRequest>,
) -> Response {
    lease_op(&state, &headers, "seal", request, |peer, id| {
        Box::pin(async move { peer.seal(id).await })
    })
    .await
}

async fn discard_handler(
    State(state): State<HttpState>,
    Json(request): Json<LeaseRequest>,
) -> Response {
    let lease_id = match LeaseId::parse(&request.lease_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match state.peer.discard(lease_id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn release_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<LeaseRequest>,
) -> Response {
    lease_op(&state, &headers, "release", request, |peer, id| {
        Box::pin(async move { peer.release(id).await })
    })
    .await
}

async fn stats_handler(State(state): State<HttpState>) -> Json<PeerStats> {
    Json(state.peer.stats().await)
}

type LeaseOpFuture = std::pin::Pin<Box<dyn std::future::Future<Output = CacheResult<()>> + Send>>;

async fn lease_op(
    state: &HttpState,
    headers: &HeaderMap,
    op: &str,
    request: LeaseRequest,
    f: impl FnOnce(Arc<dyn Peer>, LeaseId) -> LeaseOpFuture,
) -> Response {
    let replay_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|key| format!("{}:{}", op, key));

    if let Some(key) = &replay_key {
        prune_replays(&state.replays);
        if let Some(entry) = state.replays.get(key) {
            let status = if entry.ok {
                axum::http::StatusCode::OK
            } else {
                // Replay the original failure verbatim.
                serde_json::from_str::<ErrorEnvelope>(&entry.body)
                    .map(|env| env.into_error().kind.status_code())
                    .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
            };
            return (
                status,
                [("content-type", "application/json")],
                entry.body.clone(),
            )
                .into_response();
        }
    }

    let lease_id = match LeaseId::parse(&request.lease_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    let (ok, body) = match f(state.peer.clone(), lease_id).await {
        Ok(()) => (
            true,
            serde_json::to_string(&OkResponse { ok: true }).unwrap_or_default(),
        ),
        Err(err) => (
            false,
            serde_json::to_string(&ErrorEnvelope::from_error(&err)).unwrap_or_default(),
        ),
    };

    if let Some(key) = replay_key {
        state.replays.insert(
            key,
            ReplayEntry {
                at: Instant::now(),
                ok,
                body: body.clone(),
            },
        );
    }

    let status = if ok {
        axum::http::StatusCode::OK
    } else {
        serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|env| env.into_error().kind.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
    };
    (status, [("content-type", "application/json")], body).into_response()
}

fn prune_replays(replays: &DashMap<String, ReplayEntry>) {
    let now = Instant::now();
    replays.retain(|_, entry| now.duration_since(entry.at) < IDEMPOTENCY_WINDOW);
}

/// HTTP client side of the adapter.
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(uri: &str) -> CacheResult<Self> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| CacheError::with_message(ErrorKind::Validation, e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(CacheError::transport)?;
        Ok(Self {
            base: parsed.as_str().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post_json<B, R>(&self, path: &str, body: &B, idem_key: Option<&str>) -> CacheResult<R>
    where
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut request = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body);
        if let Some(key) = idem_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }
        let response = request.send().await.map_err(CacheError::transport)?;

        if response.status().is_success() {
            response.json().await.map_err(CacheError::transport)
        } else {
            let envelope: ErrorEnvelope =
                response.json().await.map_err(CacheError::transport)?;
            Err(envelope.into_error())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn acquire(&self, request: AcquireRequest) -> CacheResult<ClientAcquired> {
        let response: AcquireResponse = self.post_json("/acquire", &request, None).await?;
        let lease_id = response.lease_id()?;
        let object = response.object.into_summary()?;

        let mut blobs = Vec::with_capacity(response.blobs.len());
        for blob in response.blobs {
            let kind = BlobKind::from_str(&blob.kind).ok_or_else(|| {
                CacheError::with_message(
                    ErrorKind::TransportError,
                    format!("unknown blob kind {:?}", blob.kind),
                )
            })?;
            blobs.push(match blob.handle {
                Some(handle) => ClientBlob::from_path(kind, blob.size, unescape_path(&handle)?),
                None => ClientBlob::opaque(kind, blob.size),
            });
        }

        Ok(ClientAcquired {
            lease_id,
            object,
            blobs,
        })
    }

    async fn seal(&self, lease_id: LeaseId) -> CacheResult<()> {
        let key = Uuid::new_v4().to_string();
        let _: OkResponse = self
            .post_json(
                "/seal",
                &LeaseRequest {
                    lease_id: lease_id.to_string(),
                },
                Some(&key),
            )
            .await?;
        Ok(())
    }

    async fn discard(&self, lease_id: LeaseId) -> CacheResult<()> {
        let _: OkResponse = self
            .post_json(
                "/discard",
                &LeaseRequest {
                    lease_id: lease_id.to_string(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn release(&self, lease_id: LeaseId) -> CacheResult<()> {
        let key = Uuid::new_v4().to_string();
        let _: OkResponse = self
            .post_json(
                "/release",
                &LeaseRequest {
                    lease_id: lease_id.to_string(),
                },
                Some(&key),
            )
            .await?;
        Ok(())
    }

    async fn stats(&self) -> CacheResult<PeerStats> {
        let response = self
            .client
            .get(format!("{}/stats", self.base))
            .send()
            .await
            .map_err(CacheError::transport)?;
        response.json().await.map_err(CacheError::transport)
    }
}
