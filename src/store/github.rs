//! GitHub contents API content store.
//!
//! Objects are files in a repository branch; the revision tag is the blob
//! SHA returned by the API. Conditioned writes pass that SHA back, which
//! GitHub rejects with 409 when the file has moved on.
//!
//! ## Status Mapping
//!
//! | Status | Error |
//! |--------|-------|
//! | 404 | `NotFound` |
//! | 409 | `RevisionConflict` |
//! | 422 on create | `AlreadyExists` |
//! | 422 otherwise | `RevisionConflict` |
//! | 5xx, 429, timeouts | `TransientIo` |
//! | anything else | `Backend` |
//!
//! The contents API omits the body of files over 1 MB; those are read
//! through the blob API by the SHA the contents call returned, so the bytes
//! always match the revision tag.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{normalize_path, ContentStore, RevisionTag, StoreError, StoredObject};

const GITHUB_API: &str = "https://api.github.com";

/// Repository coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepo {
    /// Owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Branch to read and commit to.
    pub branch: String,
}

impl GitHubRepo {
    /// Load coordinates from `{prefix}_GITHUB_OWNER`, `{prefix}_GITHUB_REPO`
    /// and `{prefix}_GITHUB_BRANCH` (default `main`).
    pub fn from_env(prefix: &str) -> Result<Self, StoreError> {
        let var = |name: &str| {
            let key = format!("{}_GITHUB_{}", prefix, name);
            std::env::var(&key).map_err(|_| StoreError::Backend(format!("{} is not set", key)))
        };
        Ok(Self {
            owner: var("OWNER")?,
            repo: var("REPO")?,
            branch: var("BRANCH").unwrap_or_else(|_| "main".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content: String,
}

impl ContentsResponse {
    /// True when the API left out the body (files over 1 MB).
    fn body_omitted(&self) -> bool {
        self.size > 0 && self.content.trim().is_empty()
    }

    fn decode(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let encoded: String = self.content.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64
            .decode(encoded)
            .map_err(|e| StoreError::Backend(format!("{}: invalid base64 content: {}", path, e)))
    }
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContent,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

/// GitHub-backed content store.
pub struct GitHubContentStore {
    repo: GitHubRepo,
    token: String,
    commit_message: String,
    api_base: String,
    http_client: reqwest::Client,
}

impl GitHubContentStore {
    /// Create a store for `repo` authenticated with `token`.
    pub fn new(repo: GitHubRepo, token: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("threat-delta/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            repo,
            token: token.into(),
            commit_message: "pipeline: update threat scores".to_string(),
            api_base: GITHUB_API.to_string(),
            http_client,
        })
    }

    /// Override the commit message used for writes.
    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    /// Override the API base URL (GitHub Enterprise).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            self.repo.owner,
            self.repo.repo,
            normalize_path(path)
        )
    }

    fn blob_url(&self, sha: &str) -> String {
        format!(
            "{}/repos/{}/{}/git/blobs/{}",
            self.api_base, self.repo.owner, self.repo.repo, sha
        )
    }

    fn authorized(&self, method: reqwest::Method, url: String, accept: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.authorized(method, self.url(path), "application/vnd.github+json")
    }

    /// Raw bytes of a blob by SHA.
    async fn get_blob(&self, path: &str, sha: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .authorized(reqwest::Method::GET, self.blob_url(sha), "application/vnd.github.raw")
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(path, status, &detail));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::transient(path, e))?;
        tracing::debug!(path = %path, sha = %sha, bytes = bytes.len(), "Fetched large object by blob");
        Ok(bytes.to_vec())
    }

    async fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        sha: Option<&str>,
        create_only: bool,
    ) -> Result<RevisionTag, StoreError> {
        let body = PutRequest {
            message: &self.commit_message,
            content: BASE64.encode(&content),
            branch: &self.repo.branch,
            sha,
        };

        let response = self
            .request(reqwest::Method::PUT, path)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        let status = response.status();
        if status.is_success() {
            let parsed: PutResponse = response
                .json()
                .await
                .map_err(|e| StoreError::transient(path, e))?;
            tracing::debug!(path = %path, sha = %parsed.content.sha, "Committed object");
            return Ok(RevisionTag::new(parsed.content.sha));
        }

        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => StoreError::RevisionConflict {
                path: normalize_path(path),
                expected: sha.unwrap_or("<none>").to_string(),
                actual: "<unknown>".to_string(),
            },
            StatusCode::UNPROCESSABLE_ENTITY if create_only => StoreError::AlreadyExists {
                path: normalize_path(path),
            },
            StatusCode::UNPROCESSABLE_ENTITY => StoreError::RevisionConflict {
                path: normalize_path(path),
                expected: sha.unwrap_or("<none>").to_string(),
                actual: "<unknown>".to_string(),
            },
            other => status_error(path, other, &detail),
        })
    }
}

fn transport_error(path: &str, e: reqwest::Error) -> StoreError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StoreError::transient(path, e)
    } else {
        StoreError::Backend(format!("{}: {}", path, e))
    }
}

fn status_error(path: &str, status: StatusCode, detail: &str) -> StoreError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::transient(path, format!("HTTP {}", status))
    } else {
        StoreError::Backend(format!("{}: HTTP {}: {}", path, status, detail))
    }
}

#[async_trait]
impl ContentStore for GitHubContentStore {
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .query(&[("ref", self.repo.branch.as_str())])
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StoreError::NotFound {
                    path: normalize_path(path),
                })
            }
            other => {
                let detail = response.text().await.unwrap_or_default();
                return Err(status_error(path, other, &detail));
            }
        }

        let parsed: ContentsResponse = response
            .json()
            .await
            .map_err(|e| StoreError::transient(path, e))?;
        let content = if parsed.body_omitted() {
            self.get_blob(path, &parsed.sha).await?
        } else {
            parsed.decode(path)?
        };

        Ok(StoredObject {
            content,
            revision: RevisionTag::new(parsed.sha),
        })
    }

    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        match expected {
            Some(tag) => self.write(path, content, Some(tag.as_str()), false).await,
            None => {
                // The API needs the current sha to replace a file.
                let current = match self.get(path).await {
                    Ok(obj) => Some(obj.revision),
                    Err(StoreError::NotFound { .. }) => None,
                    Err(e) => return Err(e),
                };
                self.write(path, content, current.as_ref().map(RevisionTag::as_str), false)
                    .await
            }
        }
    }

    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        self.write(path, content, None, true).await
    }
}
