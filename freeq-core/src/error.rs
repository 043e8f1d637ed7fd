//! Error taxonomy for the protocol engine.
//!
//! Transport and handshake failures bubble to the session boundary and are
//! reported through [`SessionHost::on_error`](crate::host::SessionHost::on_error).
//! External-service failures are logged and swallowed by the session. Store
//! lookups never fail.

use std::time::Duration;

/// Connect or send failure on the underlying line channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// SASL failure. Never retried by the authenticator itself.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("SASL rejected ({code}): {reason}")]
    Rejected { code: String, reason: String },
    #[error("SASL mechanism not offered by server: {available}")]
    MechanismUnavailable { available: String },
    #[error("disconnected during SASL")]
    Disconnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Which handshake step timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Capabilities,
    Authentication,
    Registration,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandshakePhase::Capabilities => "capability negotiation",
            HandshakePhase::Authentication => "authentication",
            HandshakePhase::Registration => "registration",
        })
    }
}

/// Failure of a connection attempt between transport open and `001`.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: HandshakePhase, after: Duration },
    #[error("server closed the connection during {0}")]
    Disconnected(HandshakePhase),
    #[error("nickname rejected: {0}")]
    NickRejected(String),
    #[error("server refused registration: {0}")]
    Refused(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Token issuer or server-config fetch failure. Degrades the dependent
/// feature only.
#[derive(Debug, thiserror::Error)]
#[error("{service}: {reason}")]
pub struct ExternalServiceError {
    pub service: &'static str,
    pub reason: String,
}

impl ExternalServiceError {
    pub fn new(service: &'static str, reason: impl Into<String>) -> Self {
        Self {
            service,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by [`ConnectionSession`](crate::session::ConnectionSession)
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("no saved credentials")]
    NoCredentials,
    #[error("session is closed")]
    Closed,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Encode(#[from] crate::irc::EncodeError),
}

impl From<AuthError> for SessionError {
    fn from(e: AuthError) -> Self {
        SessionError::Handshake(HandshakeError::Auth(e))
    }
}

/// A reconnect recovery step failed. The session stays `Reconnecting`.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("voice restore failed: {0}")]
    Voice(String),
}
