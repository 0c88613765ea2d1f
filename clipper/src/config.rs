//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hls_tail::{
    MasterPlaylistSource, PollerConfig, StaticPlaylistSource, TwitchUsherSource,
    VariantSelectionPolicy,
};
use reqwest::Client;
use tmi_chat::ChatConfig;

use crate::error::{Error, Result};
use crate::orchestrator::{OrchestratorConfig, SessionRetryPolicy};

#[derive(Debug, Clone, Parser)]
#[command(name = "stream-clipper")]
#[command(
    author,
    version,
    about = "Keeps the last minutes of a live stream and saves a clip when a moderator removes a chat message"
)]
pub struct Config {
    /// Channel login to follow
    #[arg(long, env = "CLIPPER_CHANNEL")]
    pub channel: String,

    /// Address the EventSub webhook listens on
    #[arg(long, env = "CLIPPER_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Secret shared with the EventSub subscription
    #[arg(long, env = "CLIPPER_EVENTSUB_SECRET", hide_env_values = true)]
    pub eventsub_secret: String,

    /// Directory clips are written to
    #[arg(long, env = "CLIPPER_OUTPUT_DIR", default_value = "clips")]
    pub output_dir: PathBuf,

    /// Directory for rolling log files
    #[arg(long, env = "CLIPPER_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Seconds of media kept in memory
    #[arg(long, env = "CLIPPER_MEDIA_WINDOW", default_value_t = 90)]
    pub media_window_secs: u64,

    /// Age in seconds of the oldest chat message kept, relative to the newest
    #[arg(long, env = "CLIPPER_MESSAGE_MAX_AGE", default_value_t = 600)]
    pub message_max_age_secs: u64,

    /// Maximum number of chat messages kept
    #[arg(long, env = "CLIPPER_MESSAGE_CAPACITY", default_value_t = 600)]
    pub message_capacity: usize,

    /// Seconds to wait after a removal before saving
    #[arg(long, env = "CLIPPER_PERSIST_DELAY", default_value_t = 30)]
    pub persist_delay_secs: u64,

    /// Minimum seconds between two saved clips
    #[arg(long, env = "CLIPPER_PERSIST_THROTTLE", default_value_t = 60)]
    pub persist_throttle_secs: u64,

    /// Messages of the removed user attached to a clip
    #[arg(long, env = "CLIPPER_MESSAGES_PER_CLIP", default_value_t = 3)]
    pub messages_per_clip: usize,

    /// Seconds shutdown waits for scheduled clips to be saved
    #[arg(long, env = "CLIPPER_SHUTDOWN_GRACE", default_value_t = 35)]
    pub shutdown_grace_secs: u64,

    /// Which rendition of the master playlist to follow
    #[arg(long, env = "CLIPPER_VARIANT", value_enum, default_value_t = VariantSelectionPolicy::First)]
    pub variant: VariantSelectionPolicy,

    /// Fixed playlist refresh interval in milliseconds, instead of the target duration
    #[arg(long, env = "CLIPPER_REFRESH_INTERVAL_MS")]
    pub refresh_interval_ms: Option<u64>,

    /// Timeout for a single playlist or segment request, in seconds
    #[arg(long, env = "CLIPPER_REQUEST_TIMEOUT", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Restarts of a failed polling session before giving up
    #[arg(long, env = "CLIPPER_SESSION_RETRIES", default_value_t = 5)]
    pub session_retries: u32,

    /// Follow this playlist URL instead of resolving the channel through Twitch
    #[arg(long, env = "CLIPPER_MASTER_URL")]
    pub master_url: Option<String>,

    /// OAuth token for playback access and chat login
    #[arg(long, env = "CLIPPER_OAUTH_TOKEN", hide_env_values = true)]
    pub oauth_token: Option<String>,

    /// Login the OAuth token belongs to, used as the chat nick
    #[arg(long, env = "CLIPPER_CHAT_NICK", requires = "oauth_token")]
    pub chat_nick: Option<String>,
}

impl Config {
    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().trim_start_matches('#').is_empty() {
            return Err(Error::config("channel must not be empty"));
        }
        if self.eventsub_secret.len() < 10 || self.eventsub_secret.len() > 100 {
            return Err(Error::config(
                "EventSub secret must be between 10 and 100 characters",
            ));
        }
        if self.media_window_secs == 0 {
            return Err(Error::config("media window must be positive"));
        }
        if self.message_capacity == 0 {
            return Err(Error::config("message capacity must be positive"));
        }
        if self.messages_per_clip == 0 {
            return Err(Error::config("messages per clip must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::config("request timeout must be positive"));
        }
        if let Some(url) = &self.master_url {
            StaticPlaylistSource::parse(url)?;
        }
        self.chat_config().login_nick()?;
        Ok(())
    }

    /// Where polling sessions get their master playlist URL.
    pub fn playlist_source(&self, client: Client) -> Result<Arc<dyn MasterPlaylistSource>> {
        if let Some(url) = &self.master_url {
            return Ok(Arc::new(StaticPlaylistSource::parse(url)?));
        }

        let mut usher = TwitchUsherSource::new(client, &self.channel);
        if let Some(token) = &self.oauth_token {
            usher = usher.with_oauth_token(token.clone());
        }
        Ok(Arc::new(usher))
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            refresh_interval: self.refresh_interval_ms.map(Duration::from_millis),
            variant_policy: self.variant,
            ..PollerConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            media_window: Duration::from_secs(self.media_window_secs),
            message_max_age: Duration::from_secs(self.message_max_age_secs),
            message_capacity: self.message_capacity,
            persist_delay: Duration::from_secs(self.persist_delay_secs),
            persist_throttle: Duration::from_secs(self.persist_throttle_secs),
            messages_per_clip: self.messages_per_clip,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            poller: self.poller_config(),
            session_retry: SessionRetryPolicy {
                max_retries: self.session_retries,
                ..SessionRetryPolicy::default()
            },
        }
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            oauth_token: self.oauth_token.clone(),
            nick: self.chat_nick.clone(),
            ..ChatConfig::default()
        }
    }
}
