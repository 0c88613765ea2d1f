use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::HlsError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// How a rendition is picked from a master playlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum VariantSelectionPolicy {
    /// First rendition in document order. Servers usually list the source quality first.
    #[default]
    First,
    /// Rendition with the highest advertised `BANDWIDTH`.
    HighestBandwidth,
    /// Rendition with the lowest advertised `BANDWIDTH`.
    LowestBandwidth,
}

/// Configurable options for the playlist poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for every request
    pub headers: HeaderMap,

    /// Timeout for a single playlist or segment request
    pub request_timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Fixed interval between playlist refreshes.
    ///
    /// When `None` the server's `#EXT-X-TARGETDURATION` is used. That value is only an
    /// approximation of the publish cadence, so segments may be observed a full target
    /// duration late.
    pub refresh_interval: Option<Duration>,

    /// Lower bound for the refresh interval, guards against a zero target duration.
    pub min_refresh_interval: Duration,

    pub variant_policy: VariantSelectionPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: PollerConfig::get_default_headers(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            refresh_interval: None,
            min_refresh_interval: Duration::from_millis(500),
            variant_policy: VariantSelectionPolicy::default(),
        }
    }
}

impl PollerConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }

    /// Build the shared HTTP client used for playlists, segments and access tokens.
    pub fn build_client(&self) -> Result<Client, HlsError> {
        install_rustls_provider();

        Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(self.headers.clone())
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| HlsError::Configuration {
                reason: format!("failed to build HTTP client: {e}"),
            })
    }
}

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}
