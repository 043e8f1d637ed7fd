//! IRC message parsing and serialization with IRCv3 message tags.
//!
//! Wire format (without the trailing `\r\n`):
//!
//! ```text
//! ['@' tags SPACE] [':' prefix SPACE] command [SPACE middle]* [SPACE ':' trailing]
//! ```
//!
//! Parsing is lenient: a line that cannot be understood yields `None` and the
//! caller drops it, so one bad line never tears down a healthy session.
//! Encoding is strict, since its inputs are built by this crate.

use std::collections::HashMap;
use std::fmt;

// Numerics the client reacts to.
pub const RPL_WELCOME: &str = "001";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const RPL_MONONLINE: &str = "730";
pub const RPL_MONOFFLINE: &str = "731";
pub const RPL_LOGGEDIN: &str = "900";
pub const ERR_NICKLOCKED: &str = "902";
pub const RPL_SASLSUCCESS: &str = "903";
pub const ERR_SASLFAIL: &str = "904";
pub const ERR_SASLTOOLONG: &str = "905";
pub const ERR_SASLABORTED: &str = "906";
pub const RPL_SASLMECHS: &str = "908";

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 tags, unescaped. Valueless tags map to an empty string.
    pub tags: HashMap<String, String>,
    /// Raw prefix without the leading `:` (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// Command, upper-cased (`PRIVMSG`, `001`, ...).
    pub command: String,
    /// Middle params followed by the trailing param, if any.
    pub params: Vec<String>,
}

/// The user a message originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("empty command")]
    EmptyCommand,
    #[error("parameter {index} contains CR, LF or NUL")]
    IllegalChar { index: usize },
    #[error("middle parameter {index} is empty, contains a space or starts with ':'")]
    InvalidMiddle { index: usize },
}

impl Message {
    /// Build a message with no tags and no prefix.
    pub fn new(command: &str, params: &[&str]) -> Self {
        Self {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Attach a tag (builder style).
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse one line. Returns `None` for lines that carry no command.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let mut tags = HashMap::new();
        if let Some(tagged) = rest.strip_prefix('@') {
            let (raw_tags, after) = tagged.split_once(' ')?;
            tags = parse_tags(raw_tags);
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (raw_prefix, after) = prefixed.split_once(' ')?;
            if raw_prefix.is_empty() {
                return None;
            }
            prefix = Some(raw_prefix.to_string());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut remaining) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            remaining = remaining.trim_start_matches(' ');
            if remaining.is_empty() {
                break;
            }
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match remaining.split_once(' ') {
                Some((token, after)) => {
                    params.push(token.to_string());
                    remaining = after;
                }
                None => {
                    params.push(remaining.to_string());
                    break;
                }
            }
        }

        Some(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Encode a command and its params into a wire line (no `\r\n`).
    ///
    /// The last param gets a `:` only when it needs one.
    pub fn encode(command: &str, params: &[&str]) -> Result<String, EncodeError> {
        if command.is_empty() || command.contains([' ', '\r', '\n', '\0']) {
            return Err(EncodeError::EmptyCommand);
        }
        for (index, param) in params.iter().enumerate() {
            if param.contains(['\r', '\n', '\0']) {
                return Err(EncodeError::IllegalChar { index });
            }
            let is_last = index + 1 == params.len();
            if !is_last && needs_trailing_marker(param) {
                return Err(EncodeError::InvalidMiddle { index });
            }
        }
        let mut out = String::from(command);
        write_params(&mut out, params.iter().copied());
        Ok(out)
    }

    /// Classify the prefix. Server-name prefixes yield `None`.
    pub fn source(&self) -> Option<Source> {
        let prefix = self.prefix.as_deref()?;
        if let Some((nick, userhost)) = prefix.split_once('!') {
            let (user, host) = match userhost.split_once('@') {
                Some((user, host)) => (user, Some(host.to_string())),
                None => (userhost, None),
            };
            return Some(Source {
                nick: nick.to_string(),
                user: Some(user.to_string()),
                host,
            });
        }
        prefix.split_once('@').map(|(nick, host)| Source {
            nick: nick.to_string(),
            user: None,
            host: Some(host.to_string()),
        })
    }

    /// Nick of the sending user, or `None` for server-originated lines.
    pub fn nick(&self) -> Option<String> {
        self.source().map(|s| s.nick)
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|s| s.as_str())
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if !self.tags.is_empty() {
            let mut keys: Vec<&String> = self.tags.keys().collect();
            keys.sort();
            out.push('@');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                out.push_str(key);
                let value = &self.tags[key];
                if !value.is_empty() {
                    out.push('=');
                    out.push_str(&escape_tag_value(value));
                }
            }
            out.push(' ');
        }
        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);
        write_params(&mut out, self.params.iter().map(|p| p.as_str()));
        f.write_str(&out)
    }
}

fn needs_trailing_marker(param: &str) -> bool {
    param.is_empty() || param.contains(' ') || param.starts_with(':')
}

fn write_params<'a>(out: &mut String, params: impl ExactSizeIterator<Item = &'a str>) {
    let last = params.len().saturating_sub(1);
    for (i, param) in params.enumerate() {
        out.push(' ');
        if i == last && needs_trailing_marker(param) {
            out.push(':');
        }
        out.push_str(param);
    }
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unescape_tag_value(value)))
        })
        .collect()
}

/// Undo IRCv3 tag-value escaping. A dangling backslash is dropped.
pub fn unescape_tag_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}
