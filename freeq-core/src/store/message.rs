//! Conversation entries held by the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Join,
    Part,
    Quit,
    NickChange,
    ModeChange,
}

/// Delivery state of a locally originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Server-assigned id, or a `local-` id for an unconfirmed local send.
    pub msgid: String,
    pub nick: String,
    pub account: Option<String>,
    /// Channel, or DM peer nick.
    pub target: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
    pub reply_to: Option<String>,
    /// Emoji → accounts that reacted with it. Never holds an empty set.
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    pub is_redacted: bool,
    pub is_edited: bool,
    pub kind: MessageKind,
    /// Only set on messages this client sent and the server has not echoed.
    pub send_state: Option<SendState>,
}

impl ChatMessage {
    /// A chat message with the current time and no metadata.
    pub fn chat(msgid: &str, nick: &str, target: &str, text: &str) -> Self {
        Self {
            msgid: msgid.to_string(),
            nick: nick.to_string(),
            account: None,
            target: target.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
            tags: HashMap::new(),
            reply_to: None,
            reactions: BTreeMap::new(),
            is_redacted: false,
            is_edited: false,
            kind: MessageKind::Chat,
            send_state: None,
        }
    }

    /// A membership/mode line (join, part, ...) rendered in the conversation.
    pub fn event(kind: MessageKind, msgid: &str, nick: &str, target: &str, text: &str) -> Self {
        Self {
            kind,
            ..Self::chat(msgid, nick, target, text)
        }
    }

    /// True for a local copy the server has not confirmed yet.
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self.send_state, Some(SendState::Sending | SendState::Failed))
    }

    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions.get(emoji).map_or(0, |s| s.len())
    }
}

/// The ids at both physical ends of a conversation buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Cursors {
    pub oldest_msgid: Option<String>,
    pub newest_msgid: Option<String>,
}
