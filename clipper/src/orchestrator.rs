//! Event-driven coordinator.
//!
//! The [`Orchestrator`] owns both buffers and reacts to [`ClipEvent`]s: stream
//! lifecycle events start and stop polling sessions, chat messages are buffered,
//! and message removals schedule a delayed, throttled clip save.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hls_tail::{
    HlsPoller, MasterPlaylistSource, MediaSegment, PollerConfig, RunOutcome, SegmentFetcher,
    SegmentHandler,
};
use parking_lot::RwLock;
use rand::RngExt;
use tmi_chat::{ChatEvent, ChatHandle, ChatMessage};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffers::{MediaBuffer, MessagesBuffer};
use crate::error::PersistError;
use crate::persister::Persister;
use crate::utils::{Delay, Throttle, TriggerHandler};

/// Everything the orchestrator reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClipEvent {
    StreamOnline,
    StreamOffline,
    ChatMessage(ChatMessage),
    MessageRemoved { username: String },
}

impl From<ChatEvent> for ClipEvent {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::Message(message) => ClipEvent::ChatMessage(message),
            ChatEvent::MessageRemoved { username } => ClipEvent::MessageRemoved { username },
        }
    }
}

/// Restart policy for a polling session that failed.
#[derive(Debug, Clone)]
pub struct SessionRetryPolicy {
    /// Restarts after the first failure. Zero disables restarts.
    pub max_retries: u32,
    /// Delay before the first restart, doubled on each further one.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random jitter, never exceeding `max_delay`.
    pub jitter: bool,
}

impl Default for SessionRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl SessionRetryPolicy {
    /// Delay before restart number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Amount of media kept in the buffer.
    pub media_window: Duration,
    /// Age of the oldest message kept, relative to the newest one.
    pub message_max_age: Duration,
    pub message_capacity: usize,
    /// Wait between a removal and the save, so the media covers what followed it.
    pub persist_delay: Duration,
    /// Minimum spacing between two saves.
    pub persist_throttle: Duration,
    /// Messages of the removed user attached to a clip.
    pub messages_per_clip: usize,
    /// How long shutdown waits for scheduled clips before abandoning them.
    pub shutdown_grace: Duration,
    pub poller: PollerConfig,
    pub session_retry: SessionRetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            media_window: Duration::from_secs(90),
            message_max_age: Duration::from_secs(600),
            message_capacity: 600,
            persist_delay: Duration::from_secs(30),
            persist_throttle: Duration::from_secs(60),
            messages_per_clip: 3,
            shutdown_grace: Duration::from_secs(35),
            poller: PollerConfig::default(),
            session_retry: SessionRetryPolicy::default(),
        }
    }
}

/// Control surface of the chat connection the orchestrator needs.
pub trait ChatControl: Send + Sync {
    fn disconnect(&self);
}

impl ChatControl for ChatHandle {
    fn disconnect(&self) {
        ChatHandle::disconnect(self)
    }
}

type SharedMedia = Arc<RwLock<Arc<MediaBuffer>>>;

/// Final stage of the persist chain: snapshot both buffers and hand them to the persister.
struct PersistClip {
    media: SharedMedia,
    messages: Arc<MessagesBuffer>,
    persister: Arc<dyn Persister>,
    messages_per_clip: usize,
}

#[async_trait]
impl TriggerHandler<String> for PersistClip {
    type Error = PersistError;

    async fn call(&self, username: String) -> Result<(), PersistError> {
        let messages = self
            .messages
            .get_by_user_name(&username, self.messages_per_clip);
        let media = self.media.read().segments();

        match self.persister.persist(&username, &media, &messages).await? {
            Some(location) => info!(
                user = %username,
                %location,
                segments = media.len(),
                messages = messages.len(),
                "Saved clip"
            ),
            None => debug!(user = %username, "Persister stored nothing"),
        }
        Ok(())
    }
}

pub struct Orchestrator<F: SegmentFetcher> {
    config: OrchestratorConfig,
    source: Arc<dyn MasterPlaylistSource>,
    fetcher: Arc<F>,
    chat: Arc<dyn ChatControl>,
    media: SharedMedia,
    messages: Arc<MessagesBuffer>,
    persist: Arc<Delay<Throttle<PersistClip>>>,
    persists: JoinSet<()>,
    root: CancellationToken,
    session: Option<CancellationToken>,
}

impl<F: SegmentFetcher + 'static> Orchestrator<F> {
    pub fn new(
        config: OrchestratorConfig,
        source: Arc<dyn MasterPlaylistSource>,
        fetcher: Arc<F>,
        persister: Arc<dyn Persister>,
        chat: Arc<dyn ChatControl>,
    ) -> Self {
        let media: SharedMedia = Arc::new(RwLock::new(Arc::new(MediaBuffer::new(
            config.media_window,
        ))));
        let messages = Arc::new(MessagesBuffer::new(
            config.message_max_age,
            config.message_capacity,
        ));

        let persist = Arc::new(Delay::new(
            Throttle::new(
                PersistClip {
                    media: media.clone(),
                    messages: messages.clone(),
                    persister,
                    messages_per_clip: config.messages_per_clip,
                },
                config.persist_throttle,
            ),
            config.persist_delay,
        ));

        Self {
            config,
            source,
            fetcher,
            chat,
            media,
            messages,
            persist,
            persists: JoinSet::new(),
            root: CancellationToken::new(),
            session: None,
        }
    }

    /// The buffer the current (or last) session writes into.
    pub fn media_buffer(&self) -> Arc<MediaBuffer> {
        self.media.read().clone()
    }

    pub fn messages_buffer(&self) -> &Arc<MessagesBuffer> {
        &self.messages
    }

    pub fn is_session_active(&self) -> bool {
        self.session.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Clip saves scheduled but not finished yet.
    pub fn pending_persists(&self) -> usize {
        self.persists.len()
    }

    /// Process events until `shutdown` fires or every sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<ClipEvent>, shutdown: CancellationToken) {
        info!("Orchestrator started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping orchestrator");
                    break;
                }
                Some(joined) = self.persists.join_next(), if !self.persists.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Clip save task failed");
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Event channel closed, stopping orchestrator");
                        break;
                    }
                },
            }
        }
        self.root.cancel();
        self.drain_persists().await;
    }

    /// Let scheduled clips finish within the grace period, abort the rest.
    async fn drain_persists(&mut self) {
        if self.persists.is_empty() {
            return;
        }

        info!(
            pending = self.persists.len(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Waiting for scheduled clips"
        );
        let persists = &mut self.persists;
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = persists.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Clip save task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = self.persists.len(),
                "Shutdown grace elapsed, abandoning scheduled clips"
            );
            self.persists.abort_all();
        }
    }

    pub fn handle_event(&mut self, event: ClipEvent) {
        match event {
            ClipEvent::StreamOnline => self.start_session(),
            ClipEvent::StreamOffline => {
                info!("Stream went offline");
                self.stop_session();
                self.chat.disconnect();
            }
            ClipEvent::ChatMessage(message) => {
                if !self.messages.insert(message) {
                    debug!("Chat message not retained");
                }
            }
            ClipEvent::MessageRemoved { username } => self.schedule_persist(username),
        }
    }

    fn start_session(&mut self) {
        self.stop_session();

        let buffer = Arc::new(MediaBuffer::new(self.config.media_window));
        *self.media.write() = buffer.clone();

        let token = self.root.child_token();
        self.session = Some(token.clone());

        let handler: Arc<dyn SegmentHandler> = Arc::new(move |segment: MediaSegment| {
            buffer.insert(segment);
        });
        let poller = HlsPoller::new(self.fetcher.clone(), handler, self.config.poller.clone());

        info!("Stream went online, starting polling session");
        tokio::spawn(run_session(
            poller,
            self.source.clone(),
            self.config.session_retry.clone(),
            token,
        ));
    }

    fn stop_session(&mut self) {
        if let Some(token) = self.session.take() {
            token.cancel();
        }
    }

    fn schedule_persist(&mut self, username: String) {
        info!(user = %username, "Message removed, scheduling clip");
        let chain = self.persist.clone();
        self.persists.spawn(async move {
            if let Err(e) = chain.call(username.clone()).await {
                error!(user = %username, error = %e, "Failed to persist clip");
            }
        });
    }
}

async fn run_session<F: SegmentFetcher + 'static>(
    poller: HlsPoller<F>,
    source: Arc<dyn MasterPlaylistSource>,
    retry: SessionRetryPolicy,
    token: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            url = source.master_playlist_url() => url,
        };
        let result = match result {
            Ok(url) => poller.run(&url, token.clone()).await,
            Err(e) => Err(e),
        };

        let error = match result {
            Ok(RunOutcome::Ended) => {
                info!("Stream playlist ended, polling session finished");
                return;
            }
            Ok(RunOutcome::Cancelled) => {
                debug!("Polling session cancelled");
                return;
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            error!(error = %error, "Polling session failed permanently");
            return;
        }

        // A session that ran for a while before failing starts a fresh backoff sequence.
        if started.elapsed() > retry.max_delay {
            attempt = 0;
        }
        if attempt >= retry.max_retries {
            error!(
                error = %error,
                retries = retry.max_retries,
                "Polling session failed, retries exhausted"
            );
            return;
        }

        let delay = retry.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            error = %error,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Polling session failed, restarting"
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
