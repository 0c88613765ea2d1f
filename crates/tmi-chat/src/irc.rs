//! Twitch IRC line decoding and handshake.
//!
//! Lines have the shape `[@tags] [:prefix] COMMAND [params] [:trailing]`. Only the
//! commands the clip keeper reacts to are decoded; everything else is ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::message::{ChatEvent, ChatMessage};

/// Requests tags (message ids, timestamps, logins) and moderation commands.
pub const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";

/// One parsed IRC line borrowing from the raw text.
#[derive(Debug, PartialEq)]
pub struct IrcLine<'a> {
    pub tags: HashMap<&'a str, &'a str>,
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
}

impl<'a> IrcLine<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let mut tags = HashMap::new();
        if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_str, remaining) = tagged.split_once(' ')?;
            for tag in tag_str.split(';') {
                match tag.split_once('=') {
                    Some((key, value)) => tags.insert(key, value),
                    None => tags.insert(tag, ""),
                };
            }
            rest = remaining.trim_start();
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (p, remaining) = prefixed.split_once(' ')?;
            prefix = Some(p);
            rest = remaining.trim_start();
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, remaining)) => (command, remaining),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing);
                break;
            }
            match rest.split_once(' ') {
                Some((param, remaining)) => {
                    params.push(param);
                    rest = remaining.trim_start();
                }
                None => {
                    params.push(rest);
                    break;
                }
            }
        }

        Some(Self {
            tags,
            prefix,
            command,
            params,
        })
    }

    /// Nick part of a `nick!user@host` prefix.
    pub fn nick(&self) -> Option<&'a str> {
        self.prefix
            .and_then(|p| p.split('!').next())
            .filter(|n| !n.is_empty())
    }

    pub fn tag(&self, key: &str) -> Option<&'a str> {
        self.tags.get(key).copied().filter(|v| !v.is_empty())
    }

    /// Last parameter, usually the trailing text.
    pub fn trailing(&self) -> Option<&'a str> {
        self.params.last().copied()
    }

    fn sent_at(&self) -> DateTime<Utc> {
        self.tag("tmi-sent-ts")
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }
}

/// What the connection task should do with one decoded line.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Event(ChatEvent),
    /// Reply with `PONG` carrying this payload.
    Ping(String),
    /// Server is about to restart; reconnect.
    Reconnect,
    Ignored,
}

pub fn decode_line(line: &str) -> Decoded {
    let Some(irc) = IrcLine::parse(line) else {
        return Decoded::Ignored;
    };

    match irc.command {
        "PING" => Decoded::Ping(irc.trailing().unwrap_or("tmi.twitch.tv").to_string()),
        "RECONNECT" => Decoded::Reconnect,
        "PRIVMSG" => decode_privmsg(&irc).map_or(Decoded::Ignored, Decoded::Event),
        // @login=<user>;target-msg-id=<id> :tmi.twitch.tv CLEARMSG #<channel> :<text>
        "CLEARMSG" => irc.tag("login").map_or(Decoded::Ignored, |login| {
            Decoded::Event(ChatEvent::MessageRemoved {
                username: login.to_lowercase(),
            })
        }),
        // A CLEARCHAT without a target user wipes the whole room and names nobody.
        "CLEARCHAT" if irc.params.len() >= 2 => irc
            .trailing()
            .filter(|target| !target.is_empty())
            .map_or(Decoded::Ignored, |target| {
                Decoded::Event(ChatEvent::MessageRemoved {
                    username: target.to_lowercase(),
                })
            }),
        _ => Decoded::Ignored,
    }
}

fn decode_privmsg(irc: &IrcLine<'_>) -> Option<ChatEvent> {
    let author = irc.nick()?.to_lowercase();
    let text = irc.params.get(1)?.trim();

    let id = irc
        .tag("id")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Some(ChatEvent::Message(ChatMessage::new(
        id,
        author,
        text,
        irc.sent_at(),
    )))
}

/// Random anonymous login, accepted by Twitch for read-only sessions.
pub fn anonymous_nick() -> String {
    format!("justinfan{}", rand::random_range(1000u32..100_000u32))
}

/// Normalize a channel name to `#login`.
pub fn channel_target(channel: &str) -> String {
    let login = channel.trim().trim_start_matches('#').to_lowercase();
    format!("#{login}")
}

/// Lines to send right after the WebSocket upgrade.
pub fn handshake(channel: &str, oauth_token: Option<&str>, nick: &str) -> Vec<String> {
    let pass = match oauth_token {
        Some(token) if token.starts_with("oauth:") => format!("PASS {token}"),
        Some(token) => format!("PASS oauth:{token}"),
        None => "PASS oauth:".to_string(),
    };

    vec![
        CAPABILITIES.to_string(),
        pass,
        format!("NICK {nick}"),
        format!("JOIN {}", channel_target(channel)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_privmsg_with_tags() {
        let line = "@badge-info=;badges=broadcaster/1;color=#FF0000;display-name=TestUser;emotes=;id=abc123;mod=0;room-id=12345;subscriber=0;tmi-sent-ts=1700000000123;turbo=0;user-id=67890;user-type= :testuser!testuser@testuser.tmi.twitch.tv PRIVMSG #channel :Hello world!";

        let Decoded::Event(ChatEvent::Message(msg)) = decode_line(line) else {
            panic!("expected chat message");
        };
        assert_eq!(msg.id, "abc123");
        assert_eq!(msg.author_name, "testuser");
        assert_eq!(msg.text, "Hello world!");
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn privmsg_text_keeps_inner_colons() {
        let line = ":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #channel :time is 12:30 :)";
        let Decoded::Event(ChatEvent::Message(msg)) = decode_line(line) else {
            panic!("expected chat message");
        };
        assert_eq!(msg.text, "time is 12:30 :)");
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn clearmsg_names_the_login() {
        let line = "@login=Ronni;room-id=;target-msg-id=abc-123-def;tmi-sent-ts=1642720582342 :tmi.twitch.tv CLEARMSG #dallas :HeyGuys";
        assert_eq!(
            decode_line(line),
            Decoded::Event(ChatEvent::MessageRemoved {
                username: "ronni".to_string()
            })
        );
    }

    #[test]
    fn targeted_clearchat_names_the_user() {
        let line = "@ban-duration=350;room-id=12345678;target-user-id=87654321;tmi-sent-ts=1642715756806 :tmi.twitch.tv CLEARCHAT #dallas :ronni";
        assert_eq!(
            decode_line(line),
            Decoded::Event(ChatEvent::MessageRemoved {
                username: "ronni".to_string()
            })
        );
    }

    #[test]
    fn room_wide_clearchat_is_ignored() {
        let line = "@room-id=12345678;tmi-sent-ts=1642715695392 :tmi.twitch.tv CLEARCHAT #dallas";
        assert_eq!(decode_line(line), Decoded::Ignored);
    }

    #[test]
    fn ping_and_reconnect() {
        assert_eq!(
            decode_line("PING :tmi.twitch.tv"),
            Decoded::Ping("tmi.twitch.tv".to_string())
        );
        assert_eq!(decode_line(":tmi.twitch.tv RECONNECT"), Decoded::Reconnect);
    }

    #[test]
    fn other_commands_are_ignored() {
        assert_eq!(
            decode_line(":tmi.twitch.tv 001 justinfan123 :Welcome, GLHF!"),
            Decoded::Ignored
        );
        assert_eq!(decode_line(""), Decoded::Ignored);
    }

    #[test]
    fn handshake_joins_lowercased_channel() {
        let lines = handshake("SomeChannel", None, "justinfan4242");
        assert_eq!(
            lines,
            vec![
                CAPABILITIES.to_string(),
                "PASS oauth:".to_string(),
                "NICK justinfan4242".to_string(),
                "JOIN #somechannel".to_string(),
            ]
        );

        let authed = handshake("#chan", Some("secret"), "nick");
        assert_eq!(authed[1], "PASS oauth:secret");
        assert_eq!(authed[3], "JOIN #chan");
    }

    #[test]
    fn anonymous_nick_shape() {
        let nick = anonymous_nick();
        assert!(nick.starts_with("justinfan"));
        assert!(nick["justinfan".len()..].parse::<u32>().is_ok());
    }
}
