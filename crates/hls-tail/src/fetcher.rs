// Segment Fetcher: stateless HTTP GET for playlists and media segments.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::trace;
use url::Url;

use crate::HlsError;

/// Downloads raw bytes for a playlist or a media segment.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Bytes, HlsError>;
}

/// [`SegmentFetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http_client: Client,
    request_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(http_client: Client, request_timeout: Duration) -> Self {
        Self {
            http_client,
            request_timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.http_client
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, HlsError> {
        let download_start = std::time::Instant::now();

        let response = self
            .http_client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HlsError::http_status(
                response.status(),
                url.as_str(),
                "fetch",
            ));
        }

        let http_version = response.version();
        let bytes = response.bytes().await?;

        trace!(
            url = %url,
            http_version = ?http_version,
            bytes = bytes.len(),
            latency_ms = download_start.elapsed().as_millis() as u64,
            "Fetched resource"
        );

        Ok(bytes)
    }
}
