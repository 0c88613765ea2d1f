//! Twitch chat over WebSocket.
//!
//! [`TwitchChatTransport::connect`] spawns one task that owns the socket, answers
//! `PING`, and reconnects with exponential backoff until the connection is
//! disconnected or the reconnect budget runs out.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ChatError, Result};
use crate::irc::{Decoded, anonymous_nick, channel_target, decode_line, handshake};
use crate::message::ChatEvent;

/// Twitch WebSocket IRC server URL
pub const TWITCH_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub server_url: String,
    /// Anonymous (`justinfan`) login when `None`.
    pub oauth_token: Option<String>,
    /// Login that owns `oauth_token`. Required whenever a token is set.
    pub nick: Option<String>,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Capacity of the event channel between the socket task and the consumer.
    pub event_buffer: usize,
}

impl ChatConfig {
    /// The `NICK` to log in with: the configured login for authenticated
    /// sessions, a random `justinfan` otherwise.
    pub fn login_nick(&self) -> Result<String> {
        let nick = self
            .nick
            .as_deref()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty());

        match (self.oauth_token.as_deref(), nick) {
            (Some(_), Some(nick)) => Ok(nick),
            (Some(_), None) => Err(ChatError::config(
                "an OAuth token requires the login (nick) it was issued for",
            )),
            (None, Some(_)) => Err(ChatError::config(
                "a nick other than the anonymous login requires an OAuth token",
            )),
            (None, None) => Ok(anonymous_nick()),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_url: TWITCH_WS_URL.to_string(),
            oauth_token: None,
            nick: None,
            max_reconnect_attempts: 10,
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            event_buffer: 256,
        }
    }
}

pub struct TwitchChatTransport;

impl TwitchChatTransport {
    /// Start reading `channel`. Returns immediately; the socket is opened by the
    /// spawned task.
    pub fn connect(channel: &str, config: ChatConfig) -> Result<ChatConnection> {
        let target = channel_target(channel);
        if target.len() < 2 {
            return Err(ChatError::config("channel name must not be empty"));
        }

        let nick = config.login_nick()?;

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let token = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            channel.to_string(),
            nick,
            config,
            events_tx,
            token.clone(),
        ));

        Ok(ChatConnection {
            events: events_rx,
            handle: ChatHandle { token },
            task,
        })
    }
}

/// Cloneable control handle for a running connection.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    token: CancellationToken,
}

impl ChatHandle {
    /// Close the socket and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        self.token.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct ChatConnection {
    events: mpsc::Receiver<ChatEvent>,
    handle: ChatHandle,
    task: JoinHandle<()>,
}

impl ChatConnection {
    /// Next chat event, `None` once the connection task has stopped.
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    pub fn handle(&self) -> ChatHandle {
        self.handle.clone()
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    /// Disconnect and wait for the socket task to finish.
    pub async fn shutdown(self) {
        self.handle.disconnect();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Chat task ended abnormally");
        }
    }
}

enum SessionEnd {
    Shutdown,
    ReceiverDropped,
    Lost,
}

async fn run_connection(
    channel: String,
    nick: String,
    config: ChatConfig,
    events_tx: mpsc::Sender<ChatEvent>,
    token: CancellationToken,
) {
    let mut attempt = 0;
    let mut delay = config.base_reconnect_delay;

    loop {
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = connect_async(config.server_url.as_str()) => result,
        };

        match connected {
            Ok((mut ws, _)) => {
                info!(channel = %channel, url = %config.server_url, "Connected to chat");

                match send_handshake(&mut ws, &channel, config.oauth_token.as_deref(), &nick).await {
                    Ok(()) => {
                        attempt = 0;
                        delay = config.base_reconnect_delay;

                        match read_session(&mut ws, &events_tx, &token).await {
                            SessionEnd::Shutdown => {
                                let _ = ws.close(None).await;
                                break;
                            }
                            SessionEnd::ReceiverDropped => {
                                debug!(channel = %channel, "Event receiver dropped");
                                let _ = ws.close(None).await;
                                break;
                            }
                            SessionEnd::Lost => {
                                warn!(channel = %channel, "Chat connection lost");
                            }
                        }
                    }
                    Err(e) => error!(channel = %channel, error = %e, "Chat handshake failed"),
                }
            }
            Err(e) => warn!(channel = %channel, error = %e, "Chat connection failed"),
        }

        if attempt >= config.max_reconnect_attempts {
            error!(channel = %channel, attempts = attempt, "Max reconnect attempts reached");
            break;
        }
        attempt += 1;

        debug!(channel = %channel, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to chat");
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(config.max_reconnect_delay);
    }

    debug!(channel = %channel, "Chat task stopped");
}

async fn send_handshake(
    ws: &mut WsStream,
    channel: &str,
    oauth_token: Option<&str>,
    nick: &str,
) -> Result<()> {
    for line in handshake(channel, oauth_token, nick) {
        ws.send(Message::Text(line.into())).await?;
    }
    Ok(())
}

async fn read_session(
    ws: &mut WsStream,
    events_tx: &mpsc::Sender<ChatEvent>,
    token: &CancellationToken,
) -> SessionEnd {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return SessionEnd::Shutdown,
            frame = ws.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Server closed chat socket");
                return SessionEnd::Lost;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "Chat socket error");
                return SessionEnd::Lost;
            }
            None => return SessionEnd::Lost,
        };

        // One frame may carry several CRLF-separated lines.
        for line in text.as_str().lines().filter(|l| !l.trim().is_empty()) {
            match decode_line(line) {
                Decoded::Event(event) => {
                    if events_tx.send(event).await.is_err() {
                        return SessionEnd::ReceiverDropped;
                    }
                }
                Decoded::Ping(payload) => {
                    let pong = format!("PONG :{payload}");
                    trace!("Sending {pong}");
                    if let Err(e) = ws.send(Message::Text(pong.into())).await {
                        warn!(error = %e, "Failed to answer PING");
                        return SessionEnd::Lost;
                    }
                }
                Decoded::Reconnect => {
                    info!("Server requested reconnect");
                    return SessionEnd::Lost;
                }
                Decoded::Ignored => trace!(line, "Ignoring chat line"),
            }
        }
    }
}
