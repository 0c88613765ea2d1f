use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("access token error: {reason}")]
    AccessToken { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl HlsError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn access_token(reason: impl Into<String>) -> Self {
        Self::AccessToken {
            reason: reason.into(),
        }
    }

    /// Whether restarting the polling session can plausibly succeed.
    ///
    /// Client errors (except 429) and malformed input are treated as permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidUrl { .. } | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { .. } | Self::Playlist { .. } | Self::AccessToken { .. } => true,
        }
    }
}
