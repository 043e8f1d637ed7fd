//! Events emitted by the session for the UI layer to consume.
//!
//! The store is the source of truth; events say what changed so a consumer
//! can re-read only the affected conversation.

use serde::Serialize;

use crate::session::ConnectionState;
use crate::store::{ChatMessage, HistoryDirection, SendState};

/// Events that the engine emits to the consumer (TUI, GUI, bot, etc.)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A transport instance was opened.
    Connected,

    StateChanged {
        state: ConnectionState,
    },

    /// Registration complete. `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// SASL succeeded.
    Authenticated {
        account: Option<String>,
    },

    /// Someone (possibly us) joined a channel.
    Joined {
        channel: String,
        nick: String,
    },

    /// Someone (possibly us) left or was kicked from a channel.
    Parted {
        channel: String,
        nick: String,
    },

    /// A message was added to a conversation buffer.
    Message {
        target: String,
        message: ChatMessage,
    },

    /// The server echoed one of our optimistic sends; the local copy now
    /// carries the server id.
    MessageConfirmed {
        target: String,
        msgid: String,
    },

    SendStateChanged {
        target: String,
        msgid: String,
        state: SendState,
    },

    MessageEdited {
        target: String,
        /// Id of the message as first seen.
        msgid: String,
        /// Id the edit arrived with.
        new_msgid: String,
    },

    MessageRedacted {
        target: String,
        msgid: String,
    },

    ReactionsChanged {
        target: String,
        msgid: String,
    },

    PinsChanged {
        channel: String,
    },

    /// A `CHATHISTORY` batch was merged.
    HistoryLoaded {
        target: String,
        count: usize,
        direction: HistoryDirection,
    },

    /// Member list for a channel after `366`.
    Names {
        channel: String,
        nicks: Vec<String>,
    },

    NickChanged {
        old_nick: String,
        new_nick: String,
    },

    UserQuit {
        nick: String,
        reason: String,
    },

    /// `MONITOR` online/offline notification.
    PresenceChanged {
        nick: String,
        online: bool,
    },

    /// Read position synced from another client.
    ReadMarker {
        target: String,
        timestamp: String,
    },

    Typing {
        target: String,
        nick: String,
        active: bool,
    },

    /// Server sent an error or notice.
    ServerNotice {
        text: String,
    },

    /// Connection was closed or lost.
    Disconnected {
        reason: String,
    },

    /// Reconnect recovery finished and the session is ready again.
    RecoveryCompleted,
}
