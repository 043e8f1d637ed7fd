//! Inbound command dispatch.
//!
//! Each parsed line is applied to the roster and the message store in one
//! synchronous step. Anything that needs I/O (protocol replies, host
//! callbacks) is returned in an [`Outcome`] for the session to carry out
//! after the locks are released.

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::host::MonitorChange;
use crate::irc::{self, Message};
use crate::msgid;
use crate::presence::{Roster, fold, is_channel};
use crate::store::{ChannelMessageStore, ChatMessage, HistoryDirection, MessageKind};

/// Side effects of one dispatched line.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub events: Vec<Event>,
    pub replies: Vec<Message>,
    /// Channels whose member list changed.
    pub invalidated: Vec<String>,
    pub monitor: Vec<MonitorChange>,
}

impl Outcome {
    fn absorb(&mut self, other: Outcome) {
        self.events.extend(other.events);
        self.replies.extend(other.replies);
        self.invalidated.extend(other.invalidated);
        self.monitor.extend(other.monitor);
    }
}

#[derive(Debug)]
struct HistoryBatch {
    target: String,
    messages: Vec<ChatMessage>,
    /// Edits, reactions and redactions inside the batch, replayed after the
    /// messages they refer to are merged.
    followups: Vec<Message>,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    pub roster: Roster,
    account: Option<String>,
    echo_message: bool,
    chathistory: bool,
    page_size: usize,
    batches: HashMap<String, HistoryBatch>,
    pending_history: HashMap<String, VecDeque<HistoryDirection>>,
    suppressed_joins: usize,
}

impl Dispatcher {
    pub fn new(page_size: usize) -> Self {
        Self {
            roster: Roster::default(),
            account: None,
            echo_message: false,
            chathistory: false,
            page_size,
            batches: HashMap::new(),
            pending_history: HashMap::new(),
            suppressed_joins: 0,
        }
    }

    pub fn apply_registration(
        &mut self,
        nick: &str,
        account: Option<&str>,
        caps: &BTreeSet<String>,
    ) {
        self.roster.set_own_nick(nick);
        self.account = account.map(str::to_string);
        self.echo_message = caps.contains("echo-message");
        self.chathistory = caps.contains("draft/chathistory") || caps.contains("chathistory");
    }

    pub fn echo_message(&self) -> bool {
        self.echo_message
    }

    pub fn chathistory(&self) -> bool {
        self.chathistory
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Who our reactions are attributed to: the account, else the nick.
    pub fn actor(&self) -> String {
        self.account
            .clone()
            .unwrap_or_else(|| self.roster.own_nick().to_string())
    }

    /// We started a DM with `nick`.
    pub fn open_dm(&mut self, nick: &str) -> Outcome {
        let mut out = Outcome::default();
        if self.roster.add_dm_partner(nick) {
            self.sync_monitor(&mut out);
        }
        out
    }

    /// Record the direction of an outgoing `CHATHISTORY` request so its
    /// batch is merged at the right end.
    pub fn expect_history(&mut self, target: &str, direction: HistoryDirection) {
        self.pending_history
            .entry(fold(target))
            .or_default()
            .push_back(direction);
    }

    /// Our next `count` self-join echoes are rejoins, not news.
    pub fn suppress_self_joins(&mut self, count: usize) {
        self.suppressed_joins = count;
    }

    /// Drop state tied to one transport instance.
    pub fn reset_transient(&mut self) {
        self.batches.clear();
        self.pending_history.clear();
        self.suppressed_joins = 0;
    }

    pub fn reset(&mut self) {
        self.reset_transient();
        self.roster.reset();
        self.account = None;
        self.echo_message = false;
        self.chathistory = false;
    }

    pub fn handle(&mut self, msg: Message, store: &mut ChannelMessageStore) -> Outcome {
        let mut out = Outcome::default();

        if let Some(id) = msg.tag("batch").map(str::to_string)
            && self.batches.contains_key(&id)
        {
            self.collect(&id, msg);
            return out;
        }

        match msg.command.as_str() {
            "PING" => {
                let token = msg.param(0).unwrap_or("");
                out.replies.push(Message::new("PONG", &[token]));
            }
            "BATCH" => self.on_batch(&msg, store, &mut out),
            "PRIVMSG" | "NOTICE" => self.on_privmsg(&msg, store, &mut out),
            "TAGMSG" => self.on_tagmsg(&msg, store, &mut out),
            "REDACT" => {
                if let (Some(conv), Some(id)) = (self.conversation(&msg), msg.param(1))
                    && store.redact_message(&conv, id)
                {
                    out.events.push(Event::MessageRedacted {
                        target: conv,
                        msgid: id.to_string(),
                    });
                }
            }
            "PIN" | "UNPIN" => {
                if let (Some(channel), Some(id)) = (msg.param(0), msg.param(1)) {
                    let changed = if msg.command == "PIN" {
                        store.pin_message(channel, id)
                    } else {
                        store.unpin_message(channel, id)
                    };
                    if changed {
                        out.events.push(Event::PinsChanged {
                            channel: channel.to_string(),
                        });
                    }
                }
            }
            "JOIN" => self.on_join(&msg, store, &mut out),
            "PART" => self.on_part(&msg, store, &mut out),
            "KICK" => self.on_kick(&msg, store, &mut out),
            "QUIT" => {
                let nick = msg.nick().unwrap_or_default();
                let reason = msg.param(0).unwrap_or("").to_string();
                for channel in self.roster.remove_everywhere(&nick) {
                    let text = format!("{nick} quit ({reason})");
                    store.add_message(
                        &channel,
                        ChatMessage::event(MessageKind::Quit, &msgid_of(&msg), &nick, &channel, &text),
                    );
                }
                out.events.push(Event::UserQuit { nick, reason });
                self.sync_monitor(&mut out);
            }
            "NICK" => {
                let old_nick = msg.nick().unwrap_or_default();
                let new_nick = msg.param(0).unwrap_or("").to_string();
                if old_nick.is_empty() || new_nick.is_empty() {
                    return out;
                }
                for channel in self.roster.rename(&old_nick, &new_nick) {
                    let text = format!("{old_nick} is now known as {new_nick}");
                    store.add_message(
                        &channel,
                        ChatMessage::event(
                            MessageKind::NickChange,
                            &msgid_of(&msg),
                            &old_nick,
                            &channel,
                            &text,
                        ),
                    );
                }
                out.events.push(Event::NickChanged { old_nick, new_nick });
                self.sync_monitor(&mut out);
            }
            "MODE" => {
                let Some(channel) = msg.param(0).filter(|t| is_channel(t)) else {
                    return out;
                };
                let set_by = msg.nick().unwrap_or_else(|| "server".to_string());
                let change = msg.params[1..].join(" ");
                let message = ChatMessage::event(
                    MessageKind::ModeChange,
                    &msgid_of(&msg),
                    &set_by,
                    channel,
                    &format!("{set_by} sets mode {change}"),
                );
                store.add_message(channel, message.clone());
                out.events.push(Event::Message {
                    target: channel.to_string(),
                    message,
                });
            }
            irc::RPL_NAMREPLY => {
                // :srv 353 me = #chan :@op +voice nick
                if let (Some(channel), Some(names)) = (msg.param(2), msg.param(3)) {
                    self.roster.names_chunk(channel, names);
                }
            }
            irc::RPL_ENDOFNAMES => {
                let Some(channel) = msg.param(1) else {
                    return out;
                };
                if let Some(nicks) = self.roster.names_end(channel) {
                    out.invalidated.push(channel.to_string());
                    out.events.push(Event::Names {
                        channel: channel.to_string(),
                        nicks,
                    });
                    self.sync_monitor(&mut out);
                }
            }
            irc::RPL_MONONLINE | irc::RPL_MONOFFLINE => {
                let online = msg.command == irc::RPL_MONONLINE;
                let list = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                for entry in list.split(',') {
                    let nick = entry.split('!').next().unwrap_or(entry).trim();
                    if !nick.is_empty() {
                        out.events.push(Event::PresenceChanged {
                            nick: nick.to_string(),
                            online,
                        });
                    }
                }
            }
            "MARKREAD" => {
                // MARKREAD <target> timestamp=<ts>
                if let (Some(target), Some(ts)) = (msg.param(0), msg.param(1)) {
                    out.events.push(Event::ReadMarker {
                        target: target.to_string(),
                        timestamp: ts.strip_prefix("timestamp=").unwrap_or(ts).to_string(),
                    });
                }
            }
            "FAIL" | "ERROR" => {
                out.events.push(Event::ServerNotice {
                    text: msg.params.join(" "),
                });
            }
            _ => {
                if let Ok(num) = msg.command.parse::<u16>()
                    && (400..600).contains(&num)
                {
                    let text = if msg.params.len() > 1 {
                        msg.params[1..].join(" ")
                    } else {
                        msg.params.join(" ")
                    };
                    out.events.push(Event::ServerNotice { text });
                }
            }
        }
        out
    }

    // ── History batches ──────────────────────────────────────────

    fn on_batch(&mut self, msg: &Message, store: &mut ChannelMessageStore, out: &mut Outcome) {
        let Some(reference) = msg.param(0) else {
            return;
        };
        if let Some(id) = reference.strip_prefix('+') {
            let kind = msg.param(1).unwrap_or("");
            if kind != "chathistory" && kind != "draft/chathistory" {
                return;
            }
            let Some(target) = msg.param(2) else {
                return;
            };
            self.batches.insert(
                id.to_string(),
                HistoryBatch {
                    target: target.to_string(),
                    messages: Vec::new(),
                    followups: Vec::new(),
                },
            );
        } else if let Some(id) = reference.strip_prefix('-') {
            let Some(batch) = self.batches.remove(id) else {
                return;
            };
            let direction = self.take_pending(&batch.target);
            if !is_channel(&batch.target) && self.roster.add_dm_partner(&batch.target) {
                self.sync_monitor(out);
            }
            let count = store.merge_history(&batch.target, batch.messages, direction);
            tracing::debug!(target = %batch.target, count, ?direction, "History batch merged");
            out.events.push(Event::HistoryLoaded {
                target: batch.target,
                count,
                direction,
            });
            for followup in batch.followups {
                let replayed = self.handle(followup, store);
                out.absorb(replayed);
            }
        }
    }

    fn collect(&mut self, id: &str, mut msg: Message) {
        msg.tags.remove("batch");
        let plain = matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE")
            && msg.tag("+draft/edit").is_none();
        let entry = if plain {
            match (self.conversation(&msg), msg.param(1)) {
                (Some(conv), Some(text)) => Some(chat_message(&msg, &conv, text)),
                _ => None,
            }
        } else {
            None
        };
        let Some(batch) = self.batches.get_mut(id) else {
            return;
        };
        match entry {
            Some(message) => batch.messages.push(message),
            None => batch.followups.push(msg),
        }
    }

    fn take_pending(&mut self, target: &str) -> HistoryDirection {
        let key = fold(target);
        let direction = self
            .pending_history
            .get_mut(&key)
            .and_then(|q| q.pop_front())
            .unwrap_or(HistoryDirection::Forward);
        if self.pending_history.get(&key).is_some_and(|q| q.is_empty()) {
            self.pending_history.remove(&key);
        }
        direction
    }

    // ── Chat ─────────────────────────────────────────────────────

    /// Conversation a message belongs to: the channel, or the other party of
    /// a DM (our own echoed DMs belong to their recipient).
    fn conversation(&self, msg: &Message) -> Option<String> {
        let target = msg.param(0)?;
        if is_channel(target) {
            return Some(target.to_string());
        }
        let from = msg.nick()?;
        if self.roster.is_self(&from) {
            Some(target.to_string())
        } else {
            Some(from)
        }
    }

    fn on_privmsg(&mut self, msg: &Message, store: &mut ChannelMessageStore, out: &mut Outcome) {
        let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
            return;
        };
        let Some(source) = msg.source() else {
            out.events.push(Event::ServerNotice {
                text: text.to_string(),
            });
            return;
        };
        let Some(conv) = self.conversation(msg) else {
            return;
        };
        if !is_channel(target) && self.roster.add_dm_partner(&conv) {
            self.sync_monitor(out);
        }

        if let Some(original) = msg.tag("+draft/edit") {
            let new_msgid = msgid_of(msg);
            if store.update_message_text(&conv, original, text, &new_msgid) {
                out.events.push(Event::MessageEdited {
                    target: conv,
                    msgid: original.to_string(),
                    new_msgid,
                });
            } else {
                tracing::debug!(msgid = %original, "Edit for unknown message");
            }
            return;
        }

        let message = chat_message(msg, &conv, text);
        if store.get_message(&conv, &message.msgid).is_some() {
            return;
        }
        if self.roster.is_self(&source.nick) {
            let msgid = message.msgid.clone();
            if store.replace_optimistic_message(&conv, message.clone()) {
                out.events.push(Event::MessageConfirmed { target: conv, msgid });
                return;
            }
        }
        store.add_message(&conv, message.clone());
        out.events.push(Event::Message {
            target: conv,
            message,
        });
    }

    fn on_tagmsg(&mut self, msg: &Message, store: &mut ChannelMessageStore, out: &mut Outcome) {
        let (Some(nick), Some(conv)) = (msg.nick(), self.conversation(msg)) else {
            return;
        };
        let actor = msg.tag("account").map(str::to_string).unwrap_or_else(|| nick.clone());

        if let Some(parent) = msg.tag("+draft/reply") {
            let changed = if let Some(emoji) = msg.tag("+draft/react") {
                store.add_reaction(&conv, parent, emoji, &actor)
            } else if let Some(emoji) = msg.tag("+draft/unreact") {
                store.remove_reaction(&conv, parent, emoji, &actor)
            } else {
                false
            };
            if changed {
                out.events.push(Event::ReactionsChanged {
                    target: conv,
                    msgid: parent.to_string(),
                });
                return;
            }
        }

        if let Some(id) = msg.tag("+draft/delete") {
            if store.redact_message(&conv, id) {
                out.events.push(Event::MessageRedacted {
                    target: conv,
                    msgid: id.to_string(),
                });
            }
            return;
        }

        if let Some(state) = msg.tag("+typing")
            && !self.roster.is_self(&nick)
        {
            out.events.push(Event::Typing {
                target: conv,
                nick,
                active: state == "active",
            });
        }
    }

    // ── Membership ───────────────────────────────────────────────

    fn on_join(&mut self, msg: &Message, store: &mut ChannelMessageStore, out: &mut Outcome) {
        let (Some(channel), Some(nick)) = (msg.param(0), msg.nick()) else {
            return;
        };

        if self.roster.is_self(&nick) {
            self.roster.join(channel);
            if self.suppressed_joins > 0 {
                self.suppressed_joins -= 1;
                tracing::debug!(%channel, "Rejoin echo suppressed");
                return;
            }
            out.events.push(Event::Joined {
                channel: channel.to_string(),
                nick,
            });
            if self.chathistory && store.is_empty(channel) {
                let limit = self.page_size.to_string();
                out.replies
                    .push(Message::new("CHATHISTORY", &["LATEST", channel, "*", &limit]));
                self.expect_history(channel, HistoryDirection::Forward);
            }
            return;
        }

        self.roster.add_member(channel, &nick);
        store.add_message(
            channel,
            ChatMessage::event(
                MessageKind::Join,
                &msgid_of(msg),
                &nick,
                channel,
                &format!("{nick} joined"),
            ),
        );
        out.events.push(Event::Joined {
            channel: channel.to_string(),
            nick,
        });
        self.sync_monitor(out);
    }

    fn on_part(&mut self, msg: &Message, store: &mut ChannelMessageStore, out: &mut Outcome) {
        let (Some(channel), Some(nick)) = (msg.param(0), msg.nick()) else {
            return;
        };
        if self.roster.is_self(&nick) {
            self.roster.leave(channel);
        } else {
            self.roster.remove_member(channel, &nick);
            store.add_message(
                channel,
                ChatMessage::event(
                    MessageKind::Part,
                    &msgid_of(msg),
                    &nick,
                    channel,
                    &format!("{nick} left"),
                ),
            );
        }
        out.events.push(Event::Parted {
            channel: channel.to_string(),
            nick,
        });
        self.sync_monitor(out);
    }

    fn on_kick(&mut self, msg: &Message, store: &mut ChannelMessageStore, out: &mut Outcome) {
        let (Some(channel), Some(victim)) = (msg.param(0), msg.param(1)) else {
            return;
        };
        let by = msg.nick().unwrap_or_else(|| "server".to_string());
        let reason = msg.param(2).unwrap_or("");
        if self.roster.is_self(victim) {
            self.roster.leave(channel);
        } else {
            self.roster.remove_member(channel, victim);
        }
        store.add_message(
            channel,
            ChatMessage::event(
                MessageKind::Part,
                &msgid_of(msg),
                victim,
                channel,
                &format!("{victim} was kicked by {by} ({reason})"),
            ),
        );
        out.events.push(Event::Parted {
            channel: channel.to_string(),
            nick: victim.to_string(),
        });
        self.sync_monitor(out);
    }

    fn sync_monitor(&mut self, out: &mut Outcome) {
        let (added, removed) = self.roster.sync_monitor();
        if !added.is_empty() {
            out.replies
                .push(Message::new("MONITOR", &["+", &added.join(",")]));
            out.monitor.push(MonitorChange::Added(added));
        }
        if !removed.is_empty() {
            out.replies
                .push(Message::new("MONITOR", &["-", &removed.join(",")]));
            out.monitor.push(MonitorChange::Removed(removed));
        }
    }
}

fn msgid_of(msg: &Message) -> String {
    msg.tag("msgid")
        .map(str::to_string)
        .unwrap_or_else(msgid::generate)
}

fn timestamp_of(msg: &Message) -> DateTime<Utc> {
    msg.tag("time")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn chat_message(msg: &Message, conversation: &str, text: &str) -> ChatMessage {
    let nick = msg.nick().unwrap_or_default();
    let mut message = ChatMessage::chat(&msgid_of(msg), &nick, conversation, text);
    message.account = msg.tag("account").map(str::to_string);
    message.timestamp = timestamp_of(msg);
    message.reply_to = msg.tag("+draft/reply").map(str::to_string);
    message.tags = msg.tags.clone();
    message
}
