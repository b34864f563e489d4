//! Peer RPC client.
//!
//! The transfer engine and hypervisors talk to remote librarians through
//! the [`Peer`] trait; [`HttpPeerClient`] is the production implementation
//! and tests substitute in-process loopbacks.

use archivist_catalog::models::LibrarianRow;
use archivist_core::rpc::{
    CommitTransferResponse, PrepareTransferRequest, PrepareTransferResponse, ResendFileRequest,
    ResendFileResponse, TransferRefRequest, TransferStatusResponse, VerifyChecksumRequest,
    VerifyChecksumResponse,
};
use archivist_core::transfer::TransferId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

/// Peer call errors.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network-level failure; worth retrying with backoff.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The peer answered with something we cannot interpret.
    #[error("peer protocol error: {0}")]
    Protocol(String),

    /// The peer understood us and said no.
    #[error("peer rejected request: {0}")]
    Rejected(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// The inter-librarian call surface.
#[async_trait]
pub trait Peer: Send + Sync {
    async fn ping(&self) -> PeerResult<()>;

    /// Open an incoming transfer on the peer. Idempotent by
    /// `(origin_librarian, origin_transfer_id)`.
    async fn prepare_transfer(
        &self,
        req: &PrepareTransferRequest,
    ) -> PeerResult<PrepareTransferResponse>;

    /// Push file bytes into the peer's staging area for `remote_id`.
    async fn upload_bytes(&self, remote_id: TransferId, data: Bytes) -> PeerResult<()>;

    /// Ask whether the peer has verified the staged bytes.
    async fn staged_transfer(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse>;

    /// Promote the staged bytes into the peer's store. Idempotent.
    async fn commit_transfer(&self, remote_id: TransferId) -> PeerResult<CommitTransferResponse>;

    async fn transfer_status(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse>;

    /// Idempotent; terminal transfers keep their state.
    async fn cancel_transfer(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse>;

    /// Ask the peer to measure its on-disk copy of a file.
    async fn verify_checksum(&self, file_name: &str) -> PeerResult<VerifyChecksumResponse>;

    /// Ask the peer (the file's origin) to send a fresh copy back to us.
    async fn resend_file(&self, req: &ResendFileRequest) -> PeerResult<ResendFileResponse>;
}

/// Hands out peer clients for librarian rows.
pub trait PeerProvider: Send + Sync {
    fn peer_for(&self, librarian: &LibrarianRow) -> Arc<dyn Peer>;
}

/// Production provider: one HTTP client per call site, sharing a reqwest
/// connection pool.
pub struct HttpPeerProvider {
    http: reqwest::Client,
}

impl HttpPeerProvider {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPeerProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerProvider for HttpPeerProvider {
    fn peer_for(&self, librarian: &LibrarianRow) -> Arc<dyn Peer> {
        Arc::new(HttpPeerClient {
            http: self.http.clone(),
            base_url: librarian.url.clone(),
            token: librarian.auth_token.clone(),
        })
    }
}

/// JSON-over-HTTP peer client.
pub struct HttpPeerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpPeerClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> PeerResult<Resp> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await
            .map_err(|e| PeerError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PeerError::Rejected(format!("{path}: {status}: {body}")));
        }
        serde_json::from_str(&body)
            .map_err(|e| PeerError::Protocol(format!("{path}: bad response body: {e}")))
    }
}

#[async_trait]
impl Peer for HttpPeerClient {
    async fn ping(&self) -> PeerResult<()> {
        let response = self
            .http
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(|e| PeerError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PeerError::Rejected(format!(
                "healthz: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn prepare_transfer(
        &self,
        req: &PrepareTransferRequest,
    ) -> PeerResult<PrepareTransferResponse> {
        self.post_json("/v1/clone/prepare", req).await
    }

    async fn upload_bytes(&self, remote_id: TransferId, data: Bytes) -> PeerResult<()> {
        let response = self
            .http
            .put(self.url(&format!("/v1/clone/upload/{remote_id}")))
            .bearer_auth(&self.token)
            .body(data)
            .send()
            .await
            .map_err(|e| PeerError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PeerError::Rejected(format!("upload: {status}: {body}")));
        }
        Ok(())
    }

    async fn staged_transfer(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse> {
        self.post_json("/v1/clone/staged", &TransferRefRequest { remote_id })
            .await
    }

    async fn commit_transfer(&self, remote_id: TransferId) -> PeerResult<CommitTransferResponse> {
        self.post_json("/v1/clone/commit", &TransferRefRequest { remote_id })
            .await
    }

    async fn transfer_status(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse> {
        self.post_json("/v1/clone/status", &TransferRefRequest { remote_id })
            .await
    }

    async fn cancel_transfer(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse> {
        self.post_json("/v1/clone/cancel", &TransferRefRequest { remote_id })
            .await
    }

    async fn verify_checksum(&self, file_name: &str) -> PeerResult<VerifyChecksumResponse> {
        self.post_json(
            "/v1/checksum/verify",
            &VerifyChecksumRequest {
                file_name: file_name.to_string(),
            },
        )
        .await
    }

    async fn resend_file(&self, req: &ResendFileRequest) -> PeerResult<ResendFileResponse> {
        self.post_json("/v1/clone/resend", req).await
    }
}

/// Initial retry backoff.
const BACKOFF_START_SECS: u64 = 1;
/// Backoff ceiling.
const BACKOFF_CAP_SECS: u64 = 30;

/// Run a peer call, retrying `Unreachable` failures with exponential
/// backoff until `deadline`. Other failures surface immediately.
pub async fn retry_to_deadline<T, F, Fut>(
    deadline: OffsetDateTime,
    op_name: &str,
    mut f: F,
) -> PeerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PeerResult<T>>,
{
    let mut backoff = BACKOFF_START_SECS;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(PeerError::Unreachable(reason)) => {
                let now = OffsetDateTime::now_utc();
                let remaining = deadline - now;
                if remaining <= time::Duration::seconds(backoff as i64) {
                    return Err(PeerError::Unreachable(format!(
                        "{op_name}: gave up at deadline: {reason}"
                    )));
                }
                tracing::debug!(op = %op_name, backoff_secs = backoff, reason = %reason, "peer unreachable, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
            }
            Err(other) => return Err(other),
        }
    }
}
