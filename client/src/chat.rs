use shared::{ChatMessage, CHAT_LOG_CAPACITY};
use std::collections::VecDeque;
use std::time::Instant;

/// The most recent chat messages, oldest first.
#[derive(Debug, Clone)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::with_capacity(CHAT_LOG_CAPACITY)
    }
}

impl ChatLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a message, evicting the oldest one when full.
    pub fn push(&mut self, message: ChatMessage) {
        if self.capacity == 0 {
            return;
        }
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Messages young enough to still be drawn at `now`.
    pub fn visible(&self, now: Instant) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(move |m| !m.is_stale(now))
    }

    pub fn latest(&self) -> Option<&ChatMessage> {
        self.messages.back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }
}
