//! Rolling window of recent chat messages.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::TimeDelta;
use parking_lot::Mutex;
use tmi_chat::ChatMessage;

/// Chat messages ordered by timestamp, bounded by age and count.
///
/// Age is measured against the newest retained message, so the window slides with
/// chat activity rather than wall time.
#[derive(Debug)]
pub struct MessagesBuffer {
    max_age: TimeDelta,
    max_count: usize,
    state: Mutex<MessagesState>,
}

#[derive(Debug, Default)]
struct MessagesState {
    messages: VecDeque<ChatMessage>,
    ids: HashSet<String>,
}

impl MessagesState {
    fn pop_oldest(&mut self) {
        if let Some(evicted) = self.messages.pop_front() {
            self.ids.remove(&evicted.id);
        }
    }
}

impl MessagesBuffer {
    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self {
            max_age: TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX),
            max_count,
            state: Mutex::new(MessagesState::default()),
        }
    }

    /// Insert `message` in timestamp order, then trim by age and count.
    ///
    /// Returns `true` when the message is retained afterwards. Duplicate ids are ignored.
    pub fn insert(&self, message: ChatMessage) -> bool {
        let mut state = self.state.lock();
        if state.ids.contains(&message.id) {
            return false;
        }

        // Equal timestamps keep arrival order.
        let pos = state
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        let id = message.id.clone();
        state.ids.insert(id.clone());
        state.messages.insert(pos, message);

        let cutoff = state
            .messages
            .back()
            .and_then(|newest| newest.timestamp.checked_sub_signed(self.max_age));
        if let Some(cutoff) = cutoff {
            while state
                .messages
                .front()
                .is_some_and(|oldest| oldest.timestamp < cutoff)
            {
                state.pop_oldest();
            }
        }

        while state.messages.len() > self.max_count {
            state.pop_oldest();
        }

        state.ids.contains(&id)
    }

    /// Up to `limit` most recent messages by `user_name`, oldest first.
    pub fn get_by_user_name(&self, user_name: &str, limit: usize) -> Vec<ChatMessage> {
        let state = self.state.lock();
        let mut matches: Vec<ChatMessage> = state
            .messages
            .iter()
            .rev()
            .filter(|m| m.author_name == user_name)
            .take(limit)
            .cloned()
            .collect();
        matches.reverse();
        matches
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }
}
