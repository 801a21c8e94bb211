use crate::app_error::{AppError, AppResult, ErrorCode};
use crate::config::GithubConfig;
use crate::hashing::validate_git_sha;
use crate::remote::{with_cancel, RemoteChange, RemoteRepo, RemoteTree};
use crate::types::WsPath;
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const FILE_MODE: &str = "100644";
const TRACKED_MODES: &[&str] = &["100644", "100755"];

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct BranchCommitInner {
    tree: ShaRef,
}

#[derive(Deserialize)]
struct BranchCommit {
    sha: String,
    commit: BranchCommitInner,
}

#[derive(Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    mode: String,
    #[serde(rename = "type")]
    kind: String,
    sha: Option<String>,
}

#[derive(Deserialize)]
struct TreeResponse {
    sha: String,
    #[serde(default)]
    truncated: bool,
    tree: Vec<TreeItem>,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

/// Branch of a GitHub repository, read and written through the git data API.
pub struct GithubRepo {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
}

impl GithubRepo {
    pub fn new(config: &GithubConfig) -> AppResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token)).map_err(|e| {
            AppError::new(
                ErrorCode::ConfigInvalid,
                "github token contains characters not allowed in a header",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("notesync/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::new(
                    ErrorCode::Internal,
                    "failed to build http client",
                    serde_json::json!({ "error": e.to_string() }),
                )
            })?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            branch: config.branch.clone(),
        })
    }

    fn url(&self, leaf: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.owner, self.repo, leaf
        )
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        leaf: &str,
        body: Option<serde_json::Value>,
        operation: &str,
    ) -> AppResult<T> {
        let url = self.url(leaf);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        tracing::debug!(%method, %url, "github request");

        let response = request.send().await.map_err(|e| {
            AppError::new(
                ErrorCode::NetworkFailed,
                "github request failed",
                serde_json::json!({ "error": e.to_string(), "operation": operation }),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, operation));
        }

        response.json::<T>().await.map_err(|e| {
            AppError::new(
                ErrorCode::InvalidRemoteResponse,
                "github returned an unexpected body",
                serde_json::json!({ "error": e.to_string(), "operation": operation }),
            )
        })
    }
}

/// Maps a non-success GitHub response onto an error code. The ref update is
/// the only call where 409/422 means the branch moved underneath us.
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    operation: &str,
) -> AppError {
    let rate_exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    let (code, message) = match status {
        StatusCode::UNAUTHORIZED => (ErrorCode::AuthFailed, "github rejected the token"),
        StatusCode::TOO_MANY_REQUESTS => (ErrorCode::RateLimited, "github rate limit exceeded"),
        StatusCode::FORBIDDEN if rate_exhausted => {
            (ErrorCode::RateLimited, "github rate limit exceeded")
        }
        StatusCode::FORBIDDEN => (ErrorCode::AuthFailed, "github denied access"),
        StatusCode::NOT_FOUND => (ErrorCode::RemoteNotFound, "github resource not found"),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY if operation == "update_ref" => {
            (ErrorCode::RemoteMoved, "branch moved since the tree was fetched")
        }
        s if s.is_server_error() => (ErrorCode::NetworkFailed, "github server error"),
        _ => (
            ErrorCode::InvalidRemoteResponse,
            "github returned an unexpected status",
        ),
    };

    let mut end = body.len().min(512);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let excerpt = &body[..end];
    AppError::new(
        code,
        message,
        serde_json::json!({
            "status": status.as_u16(),
            "operation": operation,
            "body": excerpt
        }),
    )
}

fn tree_from_response(commit_sha: String, tree: TreeResponse) -> AppResult<RemoteTree> {
    if tree.truncated {
        return Err(AppError::new(
            ErrorCode::InvalidRemoteResponse,
            "github returned a truncated tree",
            serde_json::json!({ "tree_sha": tree.sha }),
        ));
    }
    validate_git_sha(&tree.sha)?;

    let mut files = BTreeMap::new();
    for item in tree.tree {
        if item.kind != "blob" || !TRACKED_MODES.contains(&item.mode.as_str()) {
            continue;
        }
        let Some(sha) = item.sha else {
            continue;
        };
        validate_git_sha(&sha)?;
        match WsPath::parse(&item.path) {
            Ok(ws_path) => {
                files.insert(ws_path, sha);
            }
            Err(_) => {
                tracing::warn!(path = %item.path, "skipping remote file with unsupported path");
            }
        }
    }

    Ok(RemoteTree {
        commit_sha,
        tree_sha: tree.sha,
        files,
    })
}

fn decode_blob(blob: BlobResponse, sha: &str) -> AppResult<Vec<u8>> {
    match blob.encoding.as_str() {
        "base64" => {
            let compact: String = blob
                .content
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| {
                    AppError::new(
                        ErrorCode::InvalidRemoteResponse,
                        "github blob is not valid base64",
                        serde_json::json!({ "error": e.to_string(), "sha": sha }),
                    )
                })
        }
        "utf-8" => Ok(blob.content.into_bytes()),
        other => Err(AppError::new(
            ErrorCode::InvalidRemoteResponse,
            "github blob has an unknown encoding",
            serde_json::json!({ "encoding": other, "sha": sha }),
        )),
    }
}

fn change_to_tree_item(change: &RemoteChange) -> serde_json::Value {
    match change {
        RemoteChange::Upsert { ws_path, blob_sha } => serde_json::json!({
            "path": ws_path.as_str(),
            "mode": FILE_MODE,
            "type": "blob",
            "sha": blob_sha
        }),
        RemoteChange::Delete { ws_path } => serde_json::json!({
            "path": ws_path.as_str(),
            "mode": FILE_MODE,
            "type": "blob",
            "sha": serde_json::Value::Null
        }),
    }
}

#[async_trait]
impl RemoteRepo for GithubRepo {
    fn describe(&self) -> String {
        format!("github:{}/{}@{}", self.owner, self.repo, self.branch)
    }

    async fn fetch_tree(&self, cancel: &CancellationToken) -> AppResult<RemoteTree> {
        let branch: BranchResponse = with_cancel(
            cancel,
            "fetch_tree",
            self.request(
                Method::GET,
                &format!("branches/{}", self.branch),
                None,
                "get_branch",
            ),
        )
        .await?;
        validate_git_sha(&branch.commit.sha)?;

        let tree: TreeResponse = with_cancel(
            cancel,
            "fetch_tree",
            self.request(
                Method::GET,
                &format!("git/trees/{}?recursive=1", branch.commit.commit.tree.sha),
                None,
                "get_tree",
            ),
        )
        .await?;

        tree_from_response(branch.commit.sha, tree)
    }

    async fn fetch_blob(&self, blob_sha: &str, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        validate_git_sha(blob_sha)?;
        let blob: BlobResponse = with_cancel(
            cancel,
            "fetch_blob",
            self.request(
                Method::GET,
                &format!("git/blobs/{}", blob_sha),
                None,
                "get_blob",
            ),
        )
        .await?;
        decode_blob(blob, blob_sha)
    }

    async fn upload_blob(&self, bytes: &[u8], cancel: &CancellationToken) -> AppResult<String> {
        let body = serde_json::json!({
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
            "encoding": "base64"
        });
        let created: ShaRef = with_cancel(
            cancel,
            "upload_blob",
            self.request(Method::POST, "git/blobs", Some(body), "create_blob"),
        )
        .await?;
        validate_git_sha(&created.sha)?;
        Ok(created.sha)
    }

    async fn commit_changes(
        &self,
        base: &RemoteTree,
        changes: &[RemoteChange],
        message: &str,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        let items: Vec<serde_json::Value> = changes.iter().map(change_to_tree_item).collect();
        let tree: ShaRef = with_cancel(
            cancel,
            "commit_changes",
            self.request(
                Method::POST,
                "git/trees",
                Some(serde_json::json!({ "base_tree": base.tree_sha, "tree": items })),
                "create_tree",
            ),
        )
        .await?;
        validate_git_sha(&tree.sha)?;

        let commit: ShaRef = with_cancel(
            cancel,
            "commit_changes",
            self.request(
                Method::POST,
                "git/commits",
                Some(serde_json::json!({
                    "message": message,
                    "tree": tree.sha,
                    "parents": [base.commit_sha]
                })),
                "create_commit",
            ),
        )
        .await?;
        validate_git_sha(&commit.sha)?;

        let _: serde_json::Value = with_cancel(
            cancel,
            "commit_changes",
            self.request(
                Method::PATCH,
                &format!("git/refs/heads/{}", self.branch),
                Some(serde_json::json!({ "sha": commit.sha, "force": false })),
                "update_ref",
            ),
        )
        .await?;

        tracing::info!(
            repo = %self.describe(),
            commit = %commit.sha,
            changes = changes.len(),
            "pushed commit"
        );
        Ok(commit.sha)
    }
}
