//! tmi-chat: read-only Twitch chat client.
//!
//! - [`ChatMessage`] - A chat line with id, author login, text and send time
//! - [`ChatEvent`] - Either a message or a moderation removal naming a user
//! - [`TwitchChatTransport`] - Spawns the WebSocket task, yields a [`ChatConnection`]

pub mod error;
pub mod irc;
pub mod message;
pub mod transport;

pub use error::{ChatError, Result};
pub use message::{ChatEvent, ChatMessage};
pub use transport::{ChatConfig, ChatConnection, ChatHandle, TWITCH_WS_URL, TwitchChatTransport};
