use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, RANGE};
use reqwest::Client;

use crate::core::error::{UpdaterError, UpdaterResult};

const APP_USER_AGENT: &str = "Patchline/0.1.0";

pub fn build_http_client() -> Result<Client, reqwest::Error> {
    let mut default_headers = HeaderMap::new();
    // Identity encoding keeps Content-Length equal to the bytes on disk.
    default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .user_agent(APP_USER_AGENT)
        .default_headers(default_headers)
        .connect_timeout(Duration::from_secs(15))
        .build()
}

/// Chunked response body.
pub type ByteStream = BoxStream<'static, UpdaterResult<Vec<u8>>>;

/// Status and declared length of a header-only request.
#[derive(Debug, Clone, Copy)]
pub struct HeadInfo {
    pub status: u16,
    pub content_length: Option<u64>,
}

impl HeadInfo {
    pub fn exists(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// The slice of HTTP the updater needs. Swappable so catalog, mirror and
/// downloader can be exercised without a network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn head(&self, url: &str) -> UpdaterResult<HeadInfo>;

    /// GET, optionally asking for `bytes={range_start}-`.
    async fn get(&self, url: &str, range_start: Option<u64>) -> UpdaterResult<HttpResponse>;

    async fn get_text(&self, url: &str, timeout: Duration) -> UpdaterResult<String>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> UpdaterResult<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn head(&self, url: &str) -> UpdaterResult<HeadInfo> {
        let response = self.client.head(url).send().await?;
        Ok(HeadInfo {
            status: response.status().as_u16(),
            content_length: declared_length(response.headers()),
        })
    }

    async fn get(&self, url: &str, range_start: Option<u64>) -> UpdaterResult<HttpResponse> {
        let mut request = self.client.get(url);
        if let Some(offset) = range_start {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_length = declared_length(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(UpdaterError::from))
            .boxed();

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }

    async fn get_text(&self, url: &str, timeout: Duration) -> UpdaterResult<String> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdaterError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

// `Response::content_length` reports the body size hint, which is zero for
// HEAD responses; read the header instead.
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
