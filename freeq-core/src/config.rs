//! Session configuration.
//!
//! Every field has a default, so a host can deserialize a partial TOML table
//! (for example the `[connection]` section of its own config file) and get a
//! working config.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default capabilities requested during `CAP` negotiation.
pub const DEFAULT_CAPS: &[&str] = &[
    "message-tags",
    "server-time",
    "batch",
    "echo-message",
    "away-notify",
    "account-notify",
    "account-tag",
    "extended-join",
    "draft/chathistory",
    "draft/read-marker",
    "draft/message-redaction",
    "sasl",
];

/// Login used for registration and SASL PLAIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub nick: String,
    /// SASL account. Defaults to the nick when empty.
    #[serde(default)]
    pub account: String,
    /// SASL password. No SASL is attempted without one.
    #[serde(default)]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(nick: &str, account: &str, password: &str) -> Self {
        Self {
            nick: nick.to_string(),
            account: account.to_string(),
            password: Some(password.to_string()),
        }
    }

    /// Nick-only login (guest).
    pub fn guest(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            account: String::new(),
            password: None,
        }
    }

    pub fn sasl_account(&self) -> &str {
        if self.account.is_empty() {
            &self.nick
        } else {
            &self.account
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts.
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Next delay after `current`, capped, with up to 25% jitter.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let base = current.as_millis() as f64 * self.backoff_factor;
        let jitter = rand_jitter(current.as_millis() as u64 / 4);
        Duration::from_millis(((base as u64).saturating_add(jitter)).min(self.max_delay_ms))
    }
}

fn rand_jitter(max: u64) -> u64 {
    use rand::Rng;
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL handed to the token issuer and server-config source.
    pub server_url: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// Capabilities to request when offered.
    pub caps: Vec<String>,
    /// Bound on the whole CAP exchange.
    pub cap_timeout_ms: u64,
    /// Bound on the SASL exchange.
    pub sasl_timeout_ms: u64,
    /// Bound on waiting for `001` after `CAP END`.
    pub registration_timeout_ms: u64,
    /// Messages per `CHATHISTORY` request.
    pub history_page_size: usize,
    /// Messages kept per conversation.
    pub buffer_capacity: usize,
    /// Refresh the bearer token this long before it expires.
    pub token_refresh_margin_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "https://irc.freeq.at".to_string(),
            user: "freeq".to_string(),
            realname: "freeq client".to_string(),
            caps: DEFAULT_CAPS.iter().map(|c| c.to_string()).collect(),
            cap_timeout_ms: 10_000,
            sasl_timeout_ms: 15_000,
            registration_timeout_ms: 30_000,
            history_page_size: 50,
            buffer_capacity: crate::store::DEFAULT_CAPACITY,
            token_refresh_margin_secs: 60,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn cap_timeout(&self) -> Duration {
        Duration::from_millis(self.cap_timeout_ms)
    }

    pub fn sasl_timeout(&self) -> Duration {
        Duration::from_millis(self.sasl_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }

    /// Capabilities to request for `creds`. `sasl` is only wanted when there
    /// is a password to authenticate with.
    pub fn wanted_caps(&self, creds: &Credentials) -> BTreeSet<String> {
        self.caps
            .iter()
            .filter(|c| c.as_str() != "sasl" || creds.password.is_some())
            .cloned()
            .collect()
    }
}
