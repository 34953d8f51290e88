use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DropboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        summary: Option<String>,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    Permission,
    Quota,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_CONTENT_URL, token)
    }

    /// Both endpoints may point at the same host, which is how the tests run it.
    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, DropboxError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_url: Url::parse(api_url)?,
            content_url: Url::parse(content_url)?,
            token: token.into(),
        })
    }

    pub async fn current_account(&self) -> Result<Account, DropboxError> {
        self.rpc_without_arg("/2/users/get_current_account").await
    }

    pub async fn space_usage(&self) -> Result<SpaceUsage, DropboxError> {
        self.rpc_without_arg("/2/users/get_space_usage").await
    }

    /// First page of shared folders the account is a member of.
    pub async fn list_shared_folders(&self, limit: u32) -> Result<SharedFolderList, DropboxError> {
        self.rpc("/2/sharing/list_folders", &LimitArg { limit }).await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<Metadata, DropboxError> {
        self.rpc("/2/files/get_metadata", &PathArg { path }).await
    }

    /// `path` follows Dropbox conventions: the root folder is the empty string.
    pub async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
        limit: Option<u32>,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc(
            "/2/files/list_folder",
            &ListFolderArg {
                path,
                recursive,
                include_mounted_folders: true,
                limit,
            },
        )
        .await
    }

    pub async fn list_folder_continue(
        &self,
        cursor: &str,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc("/2/files/list_folder/continue", &CursorArg { cursor })
            .await
    }

    pub async fn download(&self, path: &str) -> Result<FileDownload, DropboxError> {
        let url = self.content_url.join("/2/files/download")?;
        let arg = header_safe_json(&serde_json::to_string(&PathArg { path })?);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(API_ARG_HEADER, arg)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let metadata = response
            .headers()
            .get(API_RESULT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| serde_json::from_str::<FileMetadata>(value).ok());
        Ok(FileDownload { metadata, response })
    }

    async fn rpc<A, T>(&self, endpoint: &str, arg: &A) -> Result<T, DropboxError>
    where
        A: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn rpc_without_arg<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DropboxError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DropboxError {
        let status = response.status();
        let header_hint = retry_after_from_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        let envelope = serde_json::from_str::<ApiErrorEnvelope>(&body).ok();
        let body_hint = envelope
            .as_ref()
            .and_then(|e| e.error.get("retry_after"))
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_secs);
        DropboxError::Api {
            status,
            summary: envelope.map(|e| e.error_summary),
            body,
            retry_after: header_hint.or(body_hint),
        }
    }
}

/// Streaming body of a `files/download` call.
pub struct FileDownload {
    pub metadata: Option<FileMetadata>,
    response: reqwest::Response,
}

impl FileDownload {
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    pub async fn chunk(&mut self) -> Result<Option<Bytes>, DropboxError> {
        Ok(self.response.chunk().await?)
    }
}

impl DropboxError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DropboxError::Api {
                status, summary, ..
            } => classify_api_error(*status, summary.as_deref()),
            DropboxError::Request(err)
                if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() =>
            {
                ApiErrorClass::Transient
            }
            _ => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DropboxError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_error(status: StatusCode, summary: Option<&str>) -> ApiErrorClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiErrorClass::Auth,
        StatusCode::TOO_MANY_REQUESTS => ApiErrorClass::RateLimit,
        StatusCode::INSUFFICIENT_STORAGE => ApiErrorClass::Quota,
        // 409 carries an endpoint-specific error; the summary names it.
        StatusCode::CONFLICT => classify_summary(summary.unwrap_or_default()),
        StatusCode::REQUEST_TIMEOUT => ApiErrorClass::Transient,
        status if status.is_server_error() => ApiErrorClass::Transient,
        _ => ApiErrorClass::Permanent,
    }
}

fn classify_summary(summary: &str) -> ApiErrorClass {
    if summary.contains("not_found") {
        ApiErrorClass::NotFound
    } else if summary.contains("too_many_write_operations") || summary.contains("too_many_requests")
    {
        ApiErrorClass::RateLimit
    } else if summary.contains("insufficient_space") || summary.contains("insufficient_quota") {
        ApiErrorClass::Quota
    } else if summary.contains("no_permission")
        || summary.contains("no_write_permission")
        || summary.contains("restricted_content")
        || summary.contains("access_denied")
    {
        ApiErrorClass::Permission
    } else if summary.starts_with("internal_error") {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

/// Dropbox requires non-ASCII characters in the `Dropbox-API-Arg` header to be
/// escaped as `\uXXXX`.
fn header_safe_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[derive(Serialize)]
struct PathArg<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct LimitArg {
    limit: u32,
}

#[derive(Serialize)]
struct CursorArg<'a> {
    cursor: &'a str,
}

#[derive(Serialize)]
struct ListFolderArg<'a> {
    path: &'a str,
    recursive: bool,
    include_mounted_folders: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error_summary: String,
    #[serde(default)]
    error: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Account {
    pub account_id: String,
    pub name: AccountName,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub client_modified: Option<String>,
    #[serde(default)]
    pub server_modified: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FolderMetadata {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    /// Present on shared folders and folders inside them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing_info: Option<FolderSharingInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FolderSharingInfo {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub shared_folder_id: Option<String>,
    #[serde(default)]
    pub parent_shared_folder_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocation: SpaceAllocation,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum SpaceAllocation {
    Individual { allocated: u64 },
    Team { allocated: u64 },
    #[serde(other)]
    Other,
}

impl SpaceAllocation {
    pub fn allocated(&self) -> Option<u64> {
        match self {
            SpaceAllocation::Individual { allocated } | SpaceAllocation::Team { allocated } => {
                Some(*allocated)
            }
            SpaceAllocation::Other => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SharedFolder {
    pub name: String,
    pub shared_folder_id: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SharedFolderList {
    pub entries: Vec<SharedFolder>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}
