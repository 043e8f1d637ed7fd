//! Per-conversation bounded message history.
//!
//! Each conversation (channel or DM peer) keeps at most `capacity` messages
//! in arrival order. Live traffic and forward gap-fill evict the oldest
//! entries; backward pagination evicts the newest, so the page the user asked
//! for always survives. Cursors are read off the physical ends of the buffer.
//!
//! Nothing here fails: unknown conversations, ids and emoji are no-ops or
//! empty results. Conversation keys are case-insensitive.

mod message;
mod search;

use std::collections::{HashMap, HashSet, VecDeque};

pub use message::{ChatMessage, Cursors, MessageKind, SendState};
pub use search::SearchQuery;

/// Messages kept per conversation unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 500;

/// Which end a history page attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryDirection {
    /// Older messages (`CHATHISTORY BEFORE`), prepended.
    Backward,
    /// Newer messages (`AFTER`/`LATEST`), appended.
    Forward,
}

#[derive(Debug, Default)]
struct ChannelBuffer {
    messages: VecDeque<ChatMessage>,
}

impl ChannelBuffer {
    fn cursors(&self) -> Cursors {
        Cursors {
            oldest_msgid: self.messages.front().map(|m| m.msgid.clone()),
            newest_msgid: self.messages.back().map(|m| m.msgid.clone()),
        }
    }

    fn position(&self, msgid: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.msgid == msgid)
    }

    fn find_mut(&mut self, msgid: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.msgid == msgid)
    }

    fn trim_front(&mut self, capacity: usize) {
        while self.messages.len() > capacity {
            self.messages.pop_front();
        }
    }

    fn trim_back(&mut self, capacity: usize) {
        self.messages.truncate(capacity);
    }
}

#[derive(Debug)]
pub struct ChannelMessageStore {
    capacity: usize,
    channels: HashMap<String, ChannelBuffer>,
    /// Original msgid → latest edit msgid.
    edit_chain: HashMap<String, String>,
    /// Per conversation, in pin order.
    pins: HashMap<String, Vec<String>>,
    version: u64,
}

impl Default for ChannelMessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn key(target: &str) -> String {
    target.to_lowercase()
}

impl ChannelMessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: HashMap::new(),
            edit_chain: HashMap::new(),
            pins: HashMap::new(),
            version: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bumped on every mutation; UIs compare it to decide whether to re-read.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    fn buffer_mut(&mut self, target: &str) -> &mut ChannelBuffer {
        self.channels.entry(key(target)).or_default()
    }

    fn buffer(&self, target: &str) -> Option<&ChannelBuffer> {
        self.channels.get(&key(target))
    }

    /// Lower-cased keys of every conversation with a buffer.
    pub fn conversations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.channels.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ── Insertion ────────────────────────────────────────────────

    pub fn add_message(&mut self, target: &str, msg: ChatMessage) {
        let capacity = self.capacity;
        let buf = self.buffer_mut(target);
        buf.messages.push_back(msg);
        buf.trim_front(capacity);
        self.touch();
    }

    /// Older page in front of what is buffered. Over capacity, the newest
    /// messages are dropped.
    pub fn prepend_messages(&mut self, target: &str, msgs: Vec<ChatMessage>) {
        if msgs.is_empty() {
            return;
        }
        let capacity = self.capacity;
        let buf = self.buffer_mut(target);
        let existing = std::mem::take(&mut buf.messages);
        buf.messages = msgs.into_iter().chain(existing).collect();
        buf.trim_back(capacity);
        self.touch();
    }

    /// Newer page after what is buffered. Over capacity, the oldest messages
    /// are dropped.
    pub fn append_messages(&mut self, target: &str, msgs: Vec<ChatMessage>) {
        if msgs.is_empty() {
            return;
        }
        let capacity = self.capacity;
        let buf = self.buffer_mut(target);
        buf.messages.extend(msgs);
        buf.trim_front(capacity);
        self.touch();
    }

    /// Apply a history page, skipping messages already buffered. Returns how
    /// many were new.
    pub fn merge_history(
        &mut self,
        target: &str,
        msgs: Vec<ChatMessage>,
        direction: HistoryDirection,
    ) -> usize {
        let known: HashSet<String> = self
            .buffer(target)
            .map(|b| b.messages.iter().map(|m| m.msgid.clone()).collect())
            .unwrap_or_default();
        let mut seen = HashSet::new();
        let fresh: Vec<ChatMessage> = msgs
            .into_iter()
            .filter(|m| !known.contains(&m.msgid) && seen.insert(m.msgid.clone()))
            .collect();
        let count = fresh.len();
        match direction {
            HistoryDirection::Backward => self.prepend_messages(target, fresh),
            HistoryDirection::Forward => self.append_messages(target, fresh),
        }
        count
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get_message(&self, target: &str, msgid: &str) -> Option<&ChatMessage> {
        self.buffer(target)?.messages.iter().find(|m| m.msgid == msgid)
    }

    pub fn get_messages(&self, target: &str) -> Vec<&ChatMessage> {
        self.buffer(target)
            .map(|b| b.messages.iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, target: &str) -> usize {
        self.buffer(target).map_or(0, |b| b.messages.len())
    }

    pub fn is_empty(&self, target: &str) -> bool {
        self.len(target) == 0
    }

    pub fn cursors(&self, target: &str) -> Cursors {
        self.buffer(target).map(|b| b.cursors()).unwrap_or_default()
    }

    // ── In-place mutation ────────────────────────────────────────

    pub fn redact_message(&mut self, target: &str, msgid: &str) -> bool {
        let Some(msg) = self.message_mut(target, msgid) else {
            return false;
        };
        msg.is_redacted = true;
        self.touch();
        true
    }

    pub fn add_reaction(&mut self, target: &str, msgid: &str, emoji: &str, account: &str) -> bool {
        let Some(msg) = self.message_mut(target, msgid) else {
            return false;
        };
        let added = msg
            .reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(account.to_string());
        if added {
            self.touch();
        }
        added
    }

    pub fn remove_reaction(&mut self, target: &str, msgid: &str, emoji: &str, account: &str) -> bool {
        let Some(msg) = self.message_mut(target, msgid) else {
            return false;
        };
        let Some(accounts) = msg.reactions.get_mut(emoji) else {
            return false;
        };
        let removed = accounts.remove(account);
        if accounts.is_empty() {
            msg.reactions.remove(emoji);
        }
        if removed {
            self.touch();
        }
        removed
    }

    pub fn update_send_state(&mut self, target: &str, msgid: &str, state: SendState) -> bool {
        let Some(msg) = self.message_mut(target, msgid) else {
            return false;
        };
        msg.send_state = Some(state);
        self.touch();
        true
    }

    /// Replace a message's text in place and point its edit chain at
    /// `new_msgid`. The chain is always keyed by the id passed here, so
    /// repeated edits of the same original collapse to original → latest.
    pub fn update_message_text(
        &mut self,
        target: &str,
        msgid: &str,
        new_text: &str,
        new_msgid: &str,
    ) -> bool {
        let Some(msg) = self.message_mut(target, msgid) else {
            return false;
        };
        msg.text = new_text.to_string();
        msg.is_edited = true;
        self.edit_chain
            .insert(msgid.to_string(), new_msgid.to_string());
        self.touch();
        true
    }

    /// Latest edit id for `msgid`, or `msgid` itself if never edited.
    pub fn resolve_edit_chain<'a>(&'a self, msgid: &'a str) -> &'a str {
        self.edit_chain.get(msgid).map_or(msgid, |s| s.as_str())
    }

    /// Swap the earliest unconfirmed local copy with the same nick and text
    /// for the server's echo, keeping its position. Copies still `Sending`
    /// are matched before `Failed` ones.
    pub fn replace_optimistic_message(&mut self, target: &str, echo: ChatMessage) -> bool {
        let Some(buf) = self.channels.get_mut(&key(target)) else {
            return false;
        };
        let same = |m: &ChatMessage| m.nick == echo.nick && m.text == echo.text;
        let Some(idx) = buf
            .messages
            .iter()
            .position(|m| m.send_state == Some(SendState::Sending) && same(m))
            .or_else(|| {
                buf.messages
                    .iter()
                    .position(|m| m.is_unconfirmed() && same(m))
            })
        else {
            return false;
        };
        buf.messages[idx] = echo;
        self.touch();
        true
    }

    fn message_mut(&mut self, target: &str, msgid: &str) -> Option<&mut ChatMessage> {
        self.channels.get_mut(&key(target))?.find_mut(msgid)
    }

    // ── Pins ─────────────────────────────────────────────────────

    pub fn pin_message(&mut self, target: &str, msgid: &str) -> bool {
        let pins = self.pins.entry(key(target)).or_default();
        if pins.iter().any(|p| p == msgid) {
            return false;
        }
        pins.push(msgid.to_string());
        self.touch();
        true
    }

    pub fn unpin_message(&mut self, target: &str, msgid: &str) -> bool {
        let Some(pins) = self.pins.get_mut(&key(target)) else {
            return false;
        };
        let before = pins.len();
        pins.retain(|p| p != msgid);
        let removed = pins.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    pub fn is_pinned(&self, target: &str, msgid: &str) -> bool {
        self.pins
            .get(&key(target))
            .is_some_and(|pins| pins.iter().any(|p| p == msgid))
    }

    /// Pinned ids in pin order, including ones no longer buffered.
    pub fn pinned_ids(&self, target: &str) -> Vec<&str> {
        self.pins
            .get(&key(target))
            .map(|pins| pins.iter().map(|p| p.as_str()).collect())
            .unwrap_or_default()
    }

    /// Pinned messages that are still buffered, in pin order.
    pub fn get_pinned_messages(&self, target: &str) -> Vec<&ChatMessage> {
        self.pinned_ids(target)
            .into_iter()
            .filter_map(|id| self.get_message(target, id))
            .collect()
    }

    // ── Search ───────────────────────────────────────────────────

    /// Case-insensitive text search over non-redacted chat messages, in
    /// chronological order. `in:<channel>` redirects the search; a query with
    /// no free text left matches nothing.
    pub fn search_messages(&self, target: &str, query: &str) -> Vec<&ChatMessage> {
        let query = SearchQuery::parse(query);
        if query.text.is_empty() {
            return Vec::new();
        }
        let target = query.channel.as_deref().unwrap_or(target);
        let Some(buf) = self.buffer(target) else {
            return Vec::new();
        };
        buf.messages
            .iter()
            .filter(|m| m.kind == MessageKind::Chat && !m.is_redacted)
            .filter(|m| query.matches_sender(&m.nick))
            .filter(|m| m.text.to_lowercase().contains(&query.text))
            .collect()
    }

    // ── Teardown ─────────────────────────────────────────────────

    pub fn clear_channel(&mut self, target: &str) {
        let k = key(target);
        if let Some(buf) = self.channels.remove(&k) {
            for msg in &buf.messages {
                self.edit_chain.remove(&msg.msgid);
            }
        }
        self.pins.remove(&k);
        self.touch();
    }

    pub fn reset_all(&mut self) {
        self.channels.clear();
        self.edit_chain.clear();
        self.pins.clear();
        self.touch();
    }
}
