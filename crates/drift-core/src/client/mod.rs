//! Remote sync client: stateless, authenticated, timeout-bounded request
//! layer over the sync API.
//!
//! Retry logic and queueing live in the coordinator and the operation queue;
//! this layer only translates intents into HTTP calls and classifies the
//! responses into success, conflict, or error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{
    ConflictDetail, ConflictResolution, DeleteReceipt, RemoteDocument, ResolutionReceipt,
    SyncConflict, SyncDocument, SyncUsage, UploadConflict,
};

/// Timeout for status and metadata calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for uploads, whose payload size varies
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Provides the bearer token for authenticated calls.
///
/// Token refresh is entirely the provider's responsibility; the engine only
/// asks for the current token.
pub trait AuthProvider: Send + Sync {
    /// The current bearer token, or `None` when no session exists
    fn bearer_token(&self) -> Option<String>;

    /// Whether an authenticated session exists
    fn is_authenticated(&self) -> bool {
        self.bearer_token().is_some()
    }
}

/// Outcome of an upload attempt: accepted, or rejected with a conflict.
///
/// A conflict is a first-class state transition, not an error.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// The server accepted the write and assigned a new version
    Accepted(SyncDocument),
    /// The server holds a newer version than the supplied base
    Conflict(UploadConflict),
}

/// Response of `GET /status`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    /// All non-deleted documents for this user
    pub documents: Vec<SyncDocument>,
    /// Unresolved conflicts the server knows about
    pub conflicts: Vec<SyncConflict>,
    /// Current usage aggregate
    pub usage: SyncUsage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    path: &'a str,
    content: &'a str,
    sidecar: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_version: Option<i64>,
}

#[derive(Deserialize)]
struct DocumentResponse {
    document: SyncDocument,
}

#[derive(Deserialize)]
struct ConflictResponse {
    conflict: UploadConflict,
}

#[derive(Serialize)]
struct ResolveRequest {
    resolution: ConflictResolution,
}

/// Authenticated HTTP client for the sync API
#[derive(Clone)]
pub struct RemoteSyncClient {
    endpoint: String,
    http: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
}

impl RemoteSyncClient {
    /// Create a client for the given API base URL
    pub fn new(endpoint: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(Error::from_reqwest)?;
        Ok(Self {
            endpoint,
            http,
            auth,
        })
    }

    /// Fetch the full remote picture: documents, conflicts, and usage
    pub async fn get_status(&self) -> Result<RemoteStatus> {
        self.get_json("/status").await
    }

    /// Upload a document, carrying the last observed version for optimistic
    /// concurrency. Omitting `base_version` signals a first upload.
    pub async fn upload_document(
        &self,
        path: &str,
        content: &str,
        sidecar: &str,
        base_version: Option<i64>,
    ) -> Result<UploadOutcome> {
        let token = self.token()?;
        let request = UploadRequest {
            path,
            content,
            sidecar,
            base_version,
        };

        let response = self
            .http
            .post(self.url("/documents"))
            .bearer_auth(token)
            .timeout(UPLOAD_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(Error::from_reqwest)?;

        if response.status() == StatusCode::CONFLICT {
            let body: ConflictResponse = response.json().await.map_err(Error::from_reqwest)?;
            return Ok(UploadOutcome::Conflict(body.conflict));
        }

        if response.status().is_success() {
            let body: DocumentResponse = response.json().await.map_err(Error::from_reqwest)?;
            return Ok(UploadOutcome::Accepted(body.document));
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    /// Download a document's content, sidecar, and version
    pub async fn download_document(&self, document_id: &str) -> Result<RemoteDocument> {
        self.get_json(&format!("/documents/{document_id}")).await
    }

    /// Soft-delete a document; the server retains a tombstone
    pub async fn delete_document(&self, document_id: &str) -> Result<DeleteReceipt> {
        let token = self.token()?;
        let response = self
            .http
            .delete(self.url(&format!("/documents/{document_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Error::from_reqwest)?;
        parse_json(response).await
    }

    /// Fetch both sides of a conflict
    pub async fn get_conflict(&self, conflict_id: &str) -> Result<ConflictDetail> {
        self.get_json(&format!("/conflicts/{conflict_id}")).await
    }

    /// Apply a user-chosen resolution. The server is the version authority;
    /// nothing is considered resolved until this call succeeds.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Result<ResolutionReceipt> {
        let token = self.token()?;
        let response = self
            .http
            .post(self.url(&format!("/conflicts/{conflict_id}/resolve")))
            .bearer_auth(token)
            .json(&ResolveRequest { resolution })
            .send()
            .await
            .map_err(Error::from_reqwest)?;
        parse_json(response).await
    }

    /// Fetch the usage aggregate
    pub async fn get_usage(&self) -> Result<SyncUsage> {
        self.get_json("/usage").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    /// Fails fast with `Unauthenticated` before any network round-trip
    fn token(&self) -> Result<String> {
        self.auth.bearer_token().ok_or(Error::Unauthenticated)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(Error::from_reqwest)?;
        parse_json(response).await
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(api_error(status, &body));
    }
    response.json::<T>().await.map_err(Error::from_reqwest)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Classify a non-success response. The `error` field is consumed verbatim
/// for user display when present.
fn api_error(status: StatusCode, body: &str) -> Error {
    if status == StatusCode::UNAUTHORIZED {
        return Error::Unauthenticated;
    }

    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|payload| payload.error.or(payload.message))
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                trimmed.to_string()
            }
        });

    if status == StatusCode::NOT_FOUND {
        return Error::NotFound(message);
    }

    Error::Api {
        status: status.as_u16(),
        message,
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput("endpoint must not be empty".into()));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "endpoint must include http:// or https://".into(),
        ))
    }
}

/// SHA-256 digest of document content, hex-encoded.
///
/// Matches the server's `contentHash`/`sidecarHash` computation so the
/// coordinator can skip uploads of byte-identical content.
#[must_use]
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether local content differs from the last known remote digest
#[must_use]
pub fn has_local_changes(local_content: &str, remote_hash: &str) -> bool {
    hash_content(local_content) != remote_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSession;

    impl AuthProvider for NoSession {
        fn bearer_token(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint("https://sync.example.com/".to_string()).unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn api_error_prefers_error_field_verbatim() {
        let error = api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error": "quota exceeded"}"#,
        );
        match error {
            Error::Api { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_to_status_for_empty_bodies() {
        match api_error(StatusCode::BAD_GATEWAY, "") {
            Error::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "HTTP 502");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_resources_map_to_not_found() {
        match api_error(StatusCode::NOT_FOUND, r#"{"error": "conflict not found"}"#) {
            Error::NotFound(message) => assert_eq!(message, "conflict not found"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unauthorized_responses_map_to_unauthenticated() {
        assert!(matches!(
            api_error(StatusCode::UNAUTHORIZED, "{}"),
            Error::Unauthenticated
        ));
    }

    #[tokio::test]
    async fn calls_fail_fast_without_a_session() {
        // Port 9 is discard; the call must fail before any socket is opened.
        let client = RemoteSyncClient::new("http://127.0.0.1:9", Arc::new(NoSession)).unwrap();

        assert!(matches!(
            client.get_status().await,
            Err(Error::Unauthenticated)
        ));
        assert!(matches!(
            client.upload_document("notes/a.md", "x", "{}", None).await,
            Err(Error::Unauthenticated)
        ));
        assert!(matches!(
            client.resolve_conflict("c1", ConflictResolution::Local).await,
            Err(Error::Unauthenticated)
        ));
    }

    #[test]
    fn hash_content_detects_single_byte_differences() {
        let base = hash_content("hello");
        assert_eq!(base, hash_content("hello"));
        assert_ne!(base, hash_content("hello!"));

        assert!(!has_local_changes("hello", &base));
        assert!(has_local_changes("hello!", &base));
    }

    #[test]
    fn conflict_response_carries_remote_content() {
        let body = r#"{
            "conflict": {
                "documentId": "doc-1",
                "path": "notes/a.md",
                "localVersion": 3,
                "remoteVersion": 4,
                "remoteContent": "newer remote text"
            }
        }"#;
        let parsed: ConflictResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.conflict.remote_version, 4);
        assert_eq!(parsed.conflict.remote_content, "newer remote text");
    }
}
