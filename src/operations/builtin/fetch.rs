//! Builtin operations: fetch a URL (`Fetch`) or persist a page's HTML
//! exactly as served (`Scrape`).
//!
//! Both issue a single GET with bounded timeouts and write the result
//! to an admitted destination with write-then-rename. `Fetch` can
//! optionally store readable text instead of the raw body; `Scrape`
//! never transforms the bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::{OperationError, Result};
use crate::operations::{optional_str, required_str, Artifact, Operation, OperationKind};
use crate::sandbox::{write_atomic, Sandbox};

/// Text wrapping width for html2text conversion.
const TEXT_WIDTH: usize = 100;

/// Maximum number of redirects followed by the transport.
const MAX_REDIRECTS: usize = 5;

/// A response body plus the content type it was served with.
#[derive(Debug)]
pub struct FetchedBody {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Shared HTTP client for `Fetch` and `Scrape`.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            max_response_bytes: config.max_response_bytes,
        }
    }

    /// Issues one GET and returns the complete body.
    ///
    /// Transport errors, timeouts, non-2xx statuses and bodies larger
    /// than the configured cap are all `NetworkError`.
    pub async fn get(&self, url: &str) -> Result<FetchedBody> {
        debug!("Fetching URL: {url}");

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!("Fetch of {url} failed: {e}");
            OperationError::Network(format!("{url}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OperationError::Network(format!("{url}: HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_response_bytes {
                return Err(self.too_large(url, len as usize));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                warn!("Reading body of {url} failed: {e}");
                OperationError::Network(format!("{url}: error reading response: {e}"))
            })?;
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(self.too_large(url, body.len() + chunk.len()));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedBody { content_type, body })
    }

    fn too_large(&self, url: &str, size: usize) -> OperationError {
        OperationError::Network(format!(
            "{url}: response too large ({size} bytes, limit is {} bytes)",
            self.max_response_bytes
        ))
    }
}

/// Rejects anything that is not an absolute http(s) URL.
fn validate_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| OperationError::InvalidParameters(format!("invalid URL {raw}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(OperationError::InvalidParameters(format!(
            "unsupported URL scheme '{scheme}' (only http/https)"
        ))),
    }
}

/// Returns true if the content type looks like HTML.
fn is_html(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/html") || ct.contains("application/xhtml")
}

/// Extracts readable text; HTML is converted, everything else decoded.
fn extract_text(content_type: &str, body: &[u8]) -> String {
    if is_html(content_type) {
        html2text::from_read(body, TEXT_WIDTH)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// What `Fetch` stores at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchFormat {
    Raw,
    Text,
}

impl FetchFormat {
    fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("raw") => Ok(Self::Raw),
            Some("text") => Ok(Self::Text),
            Some(other) => Err(OperationError::InvalidParameters(format!(
                "unknown fetch format '{other}' (expected 'raw' or 'text')"
            ))),
        }
    }
}

/// `Fetch`: GET a URL and write the body (or its text) to `outputPath`.
pub struct FetchOperation {
    sandbox: Arc<Sandbox>,
    fetcher: Arc<HttpFetcher>,
}

impl FetchOperation {
    pub fn new(sandbox: Arc<Sandbox>, fetcher: Arc<HttpFetcher>) -> Self {
        Self { sandbox, fetcher }
    }
}

#[async_trait]
impl Operation for FetchOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Fetch
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let url = required_str(params, "url")?;
        let output = required_str(params, "outputPath")?;
        let format = FetchFormat::parse(optional_str(params, "format")?)?;
        validate_url(url)?;

        let dest = self.sandbox.admit(output)?;
        let fetched = self.fetcher.get(url).await?;

        let contents = match format {
            FetchFormat::Raw => fetched.body,
            FetchFormat::Text => extract_text(&fetched.content_type, &fetched.body).into_bytes(),
        };
        write_atomic(&dest, contents).await?;

        Ok(Artifact::file(dest.into_path_buf()))
    }
}

/// `Scrape`: persist the HTML exactly as served, byte for byte.
pub struct ScrapeOperation {
    sandbox: Arc<Sandbox>,
    fetcher: Arc<HttpFetcher>,
}

impl ScrapeOperation {
    pub fn new(sandbox: Arc<Sandbox>, fetcher: Arc<HttpFetcher>) -> Self {
        Self { sandbox, fetcher }
    }
}

#[async_trait]
impl Operation for ScrapeOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Scrape
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let url = required_str(params, "url")?;
        let output = required_str(params, "outputPath")?;
        validate_url(url)?;

        let dest = self.sandbox.admit(output)?;
        let fetched = self.fetcher.get(url).await?;
        write_atomic(&dest, fetched.body).await?;

        Ok(Artifact::file(dest.into_path_buf()))
    }
}
