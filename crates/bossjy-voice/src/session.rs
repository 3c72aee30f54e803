//! Conversation data: transcript utterances, messages, and the bounded session window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One recognizer result. Partials are superseded by later results for the same
/// turn and never enter the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn partial(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence,
            timestamp: Utc::now(),
        }
    }

    pub fn finished(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion_tag: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            emotion_tag: None,
        }
    }

    pub fn assistant(content: impl Into<String>, emotion_tag: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            emotion_tag,
        }
    }
}

/// Sliding window of the most recent messages. Entries are never edited once
/// appended; the oldest are dropped when the window overflows.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    session_id: String,
    messages: VecDeque<Message>,
    started_at: DateTime<Utc>,
    turn_count: u64,
    limit: usize,
}

impl ConversationSession {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            messages: VecDeque::with_capacity(limit),
            started_at: Utc::now(),
            turn_count: 0,
            limit,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Number of user turns taken, including ones that slid out of the window.
    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Owned snapshot of the window, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn append(&mut self, message: Message) -> &Message {
        if message.role == Role::User {
            self.turn_count += 1;
        }
        while self.messages.len() >= self.limit {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
        &self.messages[self.messages.len() - 1]
    }
}
