//! Platform-agnostic message model.
//!
//! The Telegram layer converts incoming updates into these types so the
//! core pipeline (routing, history, media, assembly) never touches the
//! platform client's object graph.

use std::collections::HashMap;

/// Who sent a message. The bot flag drives role assignment when a message
/// is replayed into conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: u64,
    pub is_bot: bool,
}

/// Kind of attached media the backend can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

/// Reference to a downloadable file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    /// Platform file identifier, resolved to a URL at fetch time.
    pub file_id: String,
    /// Content type from message metadata, when the platform provides one.
    pub mime: Option<String>,
}

/// A received message, immutable once constructed.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: i32,
    pub chat_id: i64,
    /// True for one-on-one chats, which are processed unconditionally.
    pub private: bool,
    pub sender: Sender,
    /// Text or caption; empty string when the message carries neither.
    pub text: String,
    pub media: Vec<MediaRef>,
    /// Mention spans materialized as their exact substrings (e.g. "@relay").
    pub mentions: Vec<String>,
    /// Id of the message this one replies to, if any.
    pub parent_id: Option<i32>,
}

/// Lookup from message id to an already-fetched message. The reply chain is
/// walked through this seam rather than through a live object graph. Held
/// by reference across the awaits of a turn, hence `Sync`.
pub trait MessageLookup: Sync {
    fn get(&self, id: i32) -> Option<&InboundMessage>;
}

impl MessageLookup for HashMap<i32, InboundMessage> {
    fn get(&self, id: i32) -> Option<&InboundMessage> {
        HashMap::get(self, &id)
    }
}

impl InboundMessage {
    /// True when any mention span equals the given bot username
    /// (case-insensitive, `@` included in the span).
    pub fn mentions_user(&self, at_username: &str) -> bool {
        self.mentions
            .iter()
            .any(|m| m.eq_ignore_ascii_case(at_username))
    }

    /// Text with the first occurrence of the given mention span removed.
    /// Only the first textual match is stripped: a global replace could eat
    /// an unrelated later occurrence of the same substring.
    pub fn text_without_mention(&self, at_username: &str) -> String {
        match self
            .mentions
            .iter()
            .find(|m| m.eq_ignore_ascii_case(at_username))
        {
            Some(span) => self.text.replacen(span.as_str(), "", 1).trim().to_string(),
            None => self.text.clone(),
        }
    }
}
