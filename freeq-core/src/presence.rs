//! Joined channels, their members, DM partners and the presence subscription
//! derived from them.
//!
//! Nicks and channel names are compared case-insensitively; the display form
//! seen last is kept for output.

use std::collections::BTreeMap;

pub(crate) fn fold(name: &str) -> String {
    name.to_lowercase()
}

pub(crate) fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// Strip `NAMES` membership prefixes and any `!user@host` suffix.
fn bare_nick(entry: &str) -> &str {
    let nick = entry.trim_start_matches(['~', '&', '@', '%', '+']);
    nick.split('!').next().unwrap_or(nick)
}

#[derive(Debug, Clone, Default)]
struct JoinedChannel {
    name: String,
    members: BTreeMap<String, String>,
    /// `353` replies collected until `366` swaps them in.
    pending_names: Option<BTreeMap<String, String>>,
}

/// Nicks subscribed with `MONITOR`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoredNicks {
    nicks: BTreeMap<String, String>,
}

impl MonitoredNicks {
    pub fn contains(&self, nick: &str) -> bool {
        self.nicks.contains_key(&fold(nick))
    }

    pub fn nicks(&self) -> Vec<String> {
        self.nicks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nicks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nicks.is_empty()
    }

    /// Make the set equal to `desired`. Returns the nicks added and removed;
    /// both are empty when nothing changed.
    fn sync(&mut self, desired: BTreeMap<String, String>) -> (Vec<String>, Vec<String>) {
        let removed: Vec<String> = self
            .nicks
            .iter()
            .filter(|(k, _)| !desired.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        let added: Vec<String> = desired
            .iter()
            .filter(|(k, _)| !self.nicks.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        self.nicks = desired;
        (added, removed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    own_nick: String,
    channels: BTreeMap<String, JoinedChannel>,
    dm_partners: BTreeMap<String, String>,
    monitored: MonitoredNicks,
}

impl Roster {
    pub fn own_nick(&self) -> &str {
        &self.own_nick
    }

    pub fn set_own_nick(&mut self, nick: &str) {
        self.own_nick = nick.to_string();
    }

    pub fn is_self(&self, nick: &str) -> bool {
        !self.own_nick.is_empty() && fold(nick) == fold(&self.own_nick)
    }

    // ── Channels ─────────────────────────────────────────────────

    /// Returns true if the channel was not joined before.
    pub fn join(&mut self, channel: &str) -> bool {
        let entry = self.channels.entry(fold(channel)).or_default();
        let fresh = entry.name.is_empty();
        entry.name = channel.to_string();
        fresh
    }

    pub fn leave(&mut self, channel: &str) -> bool {
        self.channels.remove(&fold(channel)).is_some()
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.channels.contains_key(&fold(channel))
    }

    /// Display names of every joined channel.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.values().map(|c| c.name.clone()).collect()
    }

    pub fn members(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(&fold(channel))
            .map(|c| c.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_member(&mut self, channel: &str, nick: &str) {
        if let Some(c) = self.channels.get_mut(&fold(channel)) {
            c.members.insert(fold(nick), nick.to_string());
        }
    }

    pub fn remove_member(&mut self, channel: &str, nick: &str) -> bool {
        self.channels
            .get_mut(&fold(channel))
            .is_some_and(|c| c.members.remove(&fold(nick)).is_some())
    }

    /// Remove `nick` from every channel; returns the channels it was in.
    pub fn remove_everywhere(&mut self, nick: &str) -> Vec<String> {
        let key = fold(nick);
        self.channels
            .values_mut()
            .filter_map(|c| c.members.remove(&key).map(|_| c.name.clone()))
            .collect()
    }

    /// Apply a nick change everywhere; returns the channels it was seen in.
    pub fn rename(&mut self, old: &str, new: &str) -> Vec<String> {
        if self.is_self(old) {
            self.own_nick = new.to_string();
        }
        let (old_key, new_key) = (fold(old), fold(new));
        if self.dm_partners.remove(&old_key).is_some() {
            self.dm_partners.insert(new_key.clone(), new.to_string());
        }
        let mut seen = Vec::new();
        for c in self.channels.values_mut() {
            if c.members.remove(&old_key).is_some() {
                c.members.insert(new_key.clone(), new.to_string());
                seen.push(c.name.clone());
            }
        }
        seen
    }

    /// One `353` reply.
    pub fn names_chunk(&mut self, channel: &str, entries: &str) {
        let Some(c) = self.channels.get_mut(&fold(channel)) else {
            return;
        };
        let pending = c.pending_names.get_or_insert_with(BTreeMap::new);
        for entry in entries.split_whitespace() {
            let nick = bare_nick(entry);
            if !nick.is_empty() {
                pending.insert(fold(nick), nick.to_string());
            }
        }
    }

    /// `366`: replace the member list with what was collected. Returns the
    /// new member list, or `None` for a channel that is not joined.
    pub fn names_end(&mut self, channel: &str) -> Option<Vec<String>> {
        let c = self.channels.get_mut(&fold(channel))?;
        c.members = c.pending_names.take().unwrap_or_default();
        Some(c.members.values().cloned().collect())
    }

    // ── DMs and presence ─────────────────────────────────────────

    /// Returns true for a new partner.
    pub fn add_dm_partner(&mut self, nick: &str) -> bool {
        if self.is_self(nick) {
            return false;
        }
        self.dm_partners
            .insert(fold(nick), nick.to_string())
            .is_none()
    }

    pub fn dm_partners(&self) -> Vec<String> {
        self.dm_partners.values().cloned().collect()
    }

    pub fn monitored(&self) -> &MonitoredNicks {
        &self.monitored
    }

    /// Channel members plus DM partners, minus ourselves.
    fn desired_monitor(&self) -> BTreeMap<String, String> {
        let own = fold(&self.own_nick);
        self.channels
            .values()
            .flat_map(|c| c.members.iter())
            .chain(self.dm_partners.iter())
            .filter(|(k, _)| **k != own)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Bring the monitored set in line with the roster. Returns what to
    /// `MONITOR +` and `MONITOR -`.
    pub fn sync_monitor(&mut self) -> (Vec<String>, Vec<String>) {
        let desired = self.desired_monitor();
        self.monitored.sync(desired)
    }

    /// Forget the monitored set and rebuild it from scratch. Returns the full
    /// set to subscribe after `MONITOR C`.
    pub fn resubscribe_monitor(&mut self) -> Vec<String> {
        self.monitored = MonitoredNicks::default();
        let (added, _) = self.sync_monitor();
        added
    }

    pub fn reset(&mut self) {
        *self = Roster::default();
    }
}
