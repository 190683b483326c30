use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Non-success HTTP status, kept typed so callers can branch on the code
/// (403 marks an upload as rejected rather than transient).
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub body: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http status {}: {}", self.status, self.body)
    }
}

impl std::error::Error for HttpStatusError {}

/// Client for the blob service: datasite view, uploads, batched deletes and
/// presigned downloads. One shared connection pool for the whole engine.
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: HttpClient,
    user: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base: &str, user: &str, token: Option<&str>) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(32)
            .user_agent(concat!("syftbox-sync/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http,
            user: user.to_string(),
            token: token.map(|s| s.to_string()),
        })
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Websocket endpoint for the event channel.
    pub fn events_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.base).context("parse server url")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("cannot derive ws scheme from {}", self.base))?;
        url.set_path("/api/v1/events");
        url.query_pairs_mut().append_pair("user", &self.user);
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.to_string())
    }

    pub async fn healthz(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base);
        let resp = self.send(self.http.get(url)).await?;
        map_status(resp, "healthz").await
    }

    /// The server's full view of blob objects visible to this user.
    pub async fn datasite_view(&self) -> Result<DatasiteViewResponse> {
        let url = format!("{}/api/v1/datasite/view", self.base);
        let resp = self.send(self.http.get(url)).await?;
        map_error(resp, "datasite view").await
    }

    /// Upload one file under `key`; returns the stored object's metadata.
    pub async fn upload_blob(&self, key: &str, path: &Path) -> Result<UploadResponse> {
        let url = format!("{}/api/v1/blob/upload", self.base);
        let form = reqwest::multipart::Form::new().file("file", path).await?;
        let resp = self
            .send(self.http.put(url).query(&[("key", key)]).multipart(form))
            .await?;
        map_error(resp, "blob upload").await
    }

    /// Batched delete; per-key failures come back in `errors`, not as an Err.
    pub async fn delete_blobs(&self, keys: &[String]) -> Result<DeleteResponse> {
        if keys.is_empty() {
            return Ok(DeleteResponse::default());
        }
        let url = format!("{}/api/v1/blob/delete", self.base);
        let resp = self
            .send(self.http.post(url).json(&DeleteParams { keys }))
            .await?;
        map_error(resp, "blob delete").await
    }

    /// Batched presigned-download URLs; per-key failures in `errors`.
    pub async fn get_blob_presigned(&self, params: &PresignedParams) -> Result<PresignedResponse> {
        let url = format!("{}/api/v1/blob/download", self.base);
        let resp = self.send(self.http.post(url).json(params)).await?;
        map_error(resp, "blob download").await
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let mut req = req.query(&[("user", &self.user)]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?)
    }
}

/// Stream a presigned URL into `dest`, creating parent directories first.
pub async fn download_url_to_file(http: &HttpClient, url: &str, dest: &Path) -> Result<()> {
    let resp = http.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow::Error::new(HttpStatusError { status, body }).context("download"));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn map_error<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await.with_context(|| format!("{op} body"))?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::Error::new(HttpStatusError { status, body }).context(format!("{op} failed")))
}

async fn map_status(resp: Response, op: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::Error::new(HttpStatusError { status, body }).context(format!("{op} failed")))
}

#[derive(Debug, Default, Deserialize)]
pub struct DatasiteViewResponse {
    #[serde(default)]
    pub files: Vec<BlobInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobInfo {
    pub key: String,
    pub etag: String,
    pub size: i64,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub etag: String,
    pub size: i64,
    #[serde(default)]
    pub version: String,
    // Kept as a raw string so a malformed server timestamp degrades to
    // "now" instead of failing the upload.
    #[serde(rename = "lastModified", default)]
    pub last_modified: Option<String>,
}

impl UploadResponse {
    pub fn last_modified_or_now(&self) -> DateTime<Utc> {
        self.last_modified
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Serialize)]
pub struct PresignedParams {
    pub keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PresignedResponse {
    #[serde(default)]
    pub urls: Vec<BlobUrl>,
    #[serde(default)]
    pub errors: Vec<BlobKeyError>,
}

#[derive(Debug, Deserialize)]
pub struct BlobUrl {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteResponse {
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default)]
    pub errors: Vec<BlobKeyError>,
}

#[derive(Debug, Deserialize)]
pub struct BlobKeyError {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
struct DeleteParams<'a> {
    keys: &'a [String],
}
