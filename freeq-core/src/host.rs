//! Capabilities the host application injects into a session.
//!
//! The engine never touches UI state. Everything user-facing goes through
//! [`SessionHost`]; REST-backed services sit behind the smaller traits below
//! and may fail without affecting the connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Credentials;
use crate::error::ExternalServiceError;

/// Lifecycle callbacks implemented by the host (UI, bot, tests).
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// A fresh transport was opened for this session.
    fn on_connection_created(&self) {}

    /// A user-facing error to display.
    fn on_error(&self, message: &str);

    /// Any displayed error is stale (recovery succeeded).
    fn on_error_cleared(&self) {}

    /// Registration completed on the initial connect.
    fn on_welcome(&self, _nick: &str) {}

    /// A channel's member list changed and should be re-read.
    fn on_members_invalidated(&self, _channel: &str) {}

    /// The presence-monitored nick set changed.
    fn on_monitor_changed(&self, _change: &MonitorChange) {}

    /// A new bearer token is available.
    fn on_token_refreshed(&self, _token: &BearerToken) {}

    /// Re-establish any voice session after a reconnect.
    async fn restore_voice(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Mutation of the monitored-nick set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorChange {
    Added(Vec<String>),
    Removed(Vec<String>),
    Cleared,
}

/// Bearer token for the REST side of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerToken {
    pub token: String,
    /// When the token stops being valid; `None` means no refresh is scheduled.
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn fetch_token(
        &self,
        server_url: &str,
        account: &str,
        password: &str,
    ) -> Result<BearerToken, ExternalServiceError>;
}

/// Saved login, if the user chose to remember one.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<Credentials>;
}

/// Server-provided client defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Channels joined when the user has none.
    pub default_channels: Vec<String>,
    /// Channel → category name, for grouping in the UI.
    pub categories: std::collections::BTreeMap<String, String>,
    pub default_theme: Option<String>,
    /// Shortcode → image URL.
    pub custom_emoji: std::collections::BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn from_json(body: &str) -> Result<Self, ExternalServiceError> {
        serde_json::from_str(body).map_err(|e| ExternalServiceError::new("server-config", e.to_string()))
    }
}

#[async_trait]
pub trait ServerConfigSource: Send + Sync {
    async fn fetch(&self, server_url: &str) -> Result<ServerConfig, ExternalServiceError>;
}
