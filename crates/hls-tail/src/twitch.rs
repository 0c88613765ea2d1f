// Master playlist sources: where a session gets the URL it starts polling from.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::HlsError;

/// Produces a fresh master playlist URL for a polling session.
///
/// Signed URLs expire, so the orchestrator asks again on every session start.
#[async_trait]
pub trait MasterPlaylistSource: Send + Sync {
    async fn master_playlist_url(&self) -> Result<Url, HlsError>;
}

/// A fixed, pre-resolved playlist URL.
#[derive(Debug, Clone)]
pub struct StaticPlaylistSource {
    url: Url,
}

impl StaticPlaylistSource {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(input: &str) -> Result<Self, HlsError> {
        let url = Url::parse(input).map_err(|e| HlsError::invalid_url(input, e.to_string()))?;
        Ok(Self { url })
    }
}

#[async_trait]
impl MasterPlaylistSource for StaticPlaylistSource {
    async fn master_playlist_url(&self) -> Result<Url, HlsError> {
        Ok(self.url.clone())
    }
}

const GQL_API_URL: &str = "https://gql.twitch.tv/gql";
const USHER_BASE_URL: &str = "https://usher.ttvnw.net/api/channel/hls";
const WEB_CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";
const PLAYBACK_ACCESS_TOKEN_HASH: &str =
    "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9";

#[derive(Debug, Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlData {
    stream_playback_access_token: Option<PlaybackAccessToken>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaybackAccessToken {
    pub value: String,
    pub signature: String,
}

/// Resolves a Twitch channel login to a signed usher master playlist URL.
#[derive(Debug, Clone)]
pub struct TwitchUsherSource {
    client: Client,
    channel: String,
    oauth_token: Option<String>,
}

impl TwitchUsherSource {
    pub fn new(client: Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into().to_lowercase(),
            oauth_token: None,
        }
    }

    /// Authenticate access token requests, needed for subscriber-only streams.
    pub fn with_oauth_token(mut self, token: impl Into<String>) -> Self {
        self.oauth_token = Some(token.into());
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn access_token_request(&self) -> serde_json::Value {
        serde_json::json!({
            "operationName": "PlaybackAccessToken",
            "extensions": {
                "persistedQuery": {
                    "version": 1,
                    "sha256Hash": PLAYBACK_ACCESS_TOKEN_HASH,
                }
            },
            "variables": {
                "isLive": true,
                "login": self.channel,
                "isVod": false,
                "vodID": "",
                "playerType": "site",
                "isClip": false,
                "clipID": "",
                "platform": "site",
            },
        })
    }

    pub async fn fetch_access_token(&self) -> Result<PlaybackAccessToken, HlsError> {
        let mut request = self
            .client
            .post(GQL_API_URL)
            .header("Client-Id", WEB_CLIENT_ID)
            .json(&self.access_token_request());

        if let Some(token) = &self.oauth_token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("OAuth {token}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(HlsError::http_status(
                response.status(),
                GQL_API_URL,
                "access token",
            ));
        }

        let body = response.text().await?;
        parse_access_token(&body)
    }

    /// Build the usher URL for `token`.
    pub fn usher_url(&self, token: &PlaybackAccessToken) -> Result<Url, HlsError> {
        let base = format!("{USHER_BASE_URL}/{}.m3u8", self.channel);
        let cache_buster = rand::random_range(100_000u32..10_000_000u32).to_string();

        Url::parse_with_params(
            &base,
            &[
                ("player", "twitchweb"),
                ("p", cache_buster.as_str()),
                ("allow_source", "true"),
                ("allow_audio_only", "true"),
                ("allow_spectre", "true"),
                ("fast_bread", "true"),
                ("token", token.value.as_str()),
                ("sig", token.signature.as_str()),
            ],
        )
        .map_err(|e| HlsError::invalid_url(base.clone(), e.to_string()))
    }
}

#[async_trait]
impl MasterPlaylistSource for TwitchUsherSource {
    async fn master_playlist_url(&self) -> Result<Url, HlsError> {
        let token = self.fetch_access_token().await?;
        let url = self.usher_url(&token)?;
        debug!(channel = %self.channel, "Obtained usher master playlist URL");
        Ok(url)
    }
}

/// GQL answers with either a single object or a one-element array.
fn parse_access_token(body: &str) -> Result<PlaybackAccessToken, HlsError> {
    let response = match serde_json::from_str::<Vec<GqlResponse>>(body) {
        Ok(mut responses) if !responses.is_empty() => responses.swap_remove(0),
        Ok(_) => return Err(HlsError::access_token("empty GQL response")),
        Err(_) => serde_json::from_str::<GqlResponse>(body)
            .map_err(|e| HlsError::access_token(format!("malformed GQL response: {e}")))?,
    };

    response
        .data
        .and_then(|data| data.stream_playback_access_token)
        .ok_or_else(|| {
            HlsError::access_token("Could not find streamPlaybackAccessToken (channel offline?)")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_BODY: &str = r#"{"data":{"streamPlaybackAccessToken":{"value":"{\"channel\":\"somechannel\"}","signature":"abc123","__typename":"PlaybackAccessToken"}},"extensions":{"operationName":"PlaybackAccessToken"}}"#;

    #[test]
    fn parses_single_object_response() {
        let token = parse_access_token(TOKEN_BODY).unwrap();
        assert_eq!(token.signature, "abc123");
        assert_eq!(token.value, r#"{"channel":"somechannel"}"#);
    }

    #[test]
    fn parses_array_response() {
        let body = format!("[{TOKEN_BODY}]");
        let token = parse_access_token(&body).unwrap();
        assert_eq!(token.signature, "abc123");
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = parse_access_token(r#"{"data":{"streamPlaybackAccessToken":null}}"#).unwrap_err();
        assert!(matches!(err, HlsError::AccessToken { .. }));
    }

    #[test]
    fn usher_url_carries_signed_token() {
        crate::config::install_rustls_provider();
        let source = TwitchUsherSource::new(Client::new(), "SomeChannel");
        let token = PlaybackAccessToken {
            value: r#"{"channel":"somechannel"}"#.to_string(),
            signature: "abc123".to_string(),
        };

        let url = source.usher_url(&token).unwrap();
        assert_eq!(url.path(), "/api/channel/hls/somechannel.m3u8");

        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["sig"], "abc123");
        assert_eq!(params["token"], r#"{"channel":"somechannel"}"#);
        assert_eq!(params["allow_source"], "true");
        assert_eq!(params["allow_audio_only"], "true");
        assert_eq!(params["fast_bread"], "true");
        assert!(params["p"].parse::<u32>().is_ok());
    }

    #[tokio::test]
    async fn static_source_returns_its_url() {
        let source = StaticPlaylistSource::parse("https://cdn.test/master.m3u8").unwrap();
        assert_eq!(
            source.master_playlist_url().await.unwrap().as_str(),
            "https://cdn.test/master.m3u8"
        );
        assert!(StaticPlaylistSource::parse("not a url").is_err());
    }
}
