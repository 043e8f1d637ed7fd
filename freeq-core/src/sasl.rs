//! SASL PLAIN authentication over IRC.
//!
//! `AUTHENTICATE PLAIN` → `AUTHENTICATE +` → base64(`\0account\0password`)
//! in 400-byte chunks → `903` (success) or one of the failure numerics.
//! Retrying is the session's job; this module fails once and reports why.

use base64::Engine;

use crate::error::AuthError;
use crate::irc::{self, Message};
use crate::transport::Wire;

/// Maximum payload bytes per `AUTHENTICATE` line.
pub const CHUNK_SIZE: usize = 400;

/// Successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authenticated {
    /// Account name from `900 RPL_LOGGEDIN`, when the server sent one.
    pub account: Option<String>,
}

#[derive(Debug, Default)]
pub struct AuthNegotiator;

impl AuthNegotiator {
    pub fn new() -> Self {
        Self
    }

    pub(crate) async fn authenticate_plain(
        &self,
        wire: &mut Wire<'_>,
        account: &str,
        password: &str,
    ) -> Result<Authenticated, AuthError> {
        wire.send(&Message::new("AUTHENTICATE", &["PLAIN"])).await?;

        loop {
            let msg = wire.recv().await?.ok_or(AuthError::Disconnected)?;
            match msg.command.as_str() {
                "AUTHENTICATE" if msg.param(0) == Some("+") => break,
                irc::RPL_SASLMECHS => {
                    return Err(AuthError::MechanismUnavailable {
                        available: msg.param(1).unwrap_or("").to_string(),
                    });
                }
                code if is_failure(code) => return Err(rejected(&msg)),
                _ => wire.defer(msg),
            }
        }

        for chunk in plain_payload_chunks(account, password) {
            wire.send(&Message::new("AUTHENTICATE", &[&chunk])).await?;
        }

        let mut result = Authenticated::default();
        loop {
            let msg = wire.recv().await?.ok_or(AuthError::Disconnected)?;
            match msg.command.as_str() {
                // :srv 900 <nick> <nick!user@host> <account> :You are now logged in as <account>
                irc::RPL_LOGGEDIN => {
                    result.account = msg.param(2).map(|s| s.to_string());
                }
                irc::RPL_SASLSUCCESS => {
                    tracing::info!(account = ?result.account, "SASL authentication succeeded");
                    return Ok(result);
                }
                irc::RPL_SASLMECHS => {}
                code if is_failure(code) => return Err(rejected(&msg)),
                _ => wire.defer(msg),
            }
        }
    }
}

/// Encoded PLAIN payload split into `AUTHENTICATE` chunks. A trailing `+`
/// marks the end when the payload fills its last chunk exactly.
pub fn plain_payload_chunks(account: &str, password: &str) -> Vec<String> {
    let raw = format!("\0{account}\0{password}");
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
    let mut chunks: Vec<String> = encoded
        .as_bytes()
        .chunks(CHUNK_SIZE)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if encoded.len() % CHUNK_SIZE == 0 {
        chunks.push("+".to_string());
    }
    chunks
}

fn is_failure(code: &str) -> bool {
    matches!(
        code,
        irc::ERR_NICKLOCKED | irc::ERR_SASLFAIL | irc::ERR_SASLTOOLONG | irc::ERR_SASLABORTED
    )
}

fn rejected(msg: &Message) -> AuthError {
    let reason = msg
        .params
        .last()
        .filter(|_| msg.params.len() > 1)
        .cloned()
        .unwrap_or_else(|| "Unknown".to_string());
    tracing::warn!(code = %msg.command, reason = %reason, "SASL authentication failed");
    AuthError::Rejected {
        code: msg.command.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{scripted, written};

    #[test]
    fn short_payload_is_one_chunk() {
        let chunks = plain_payload_chunks("alice", "hunter2");
        assert_eq!(chunks.len(), 1);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&chunks[0])
            .unwrap();
        assert_eq!(decoded, b"\0alice\0hunter2");
    }

    #[test]
    fn exact_multiple_gets_terminator() {
        // 2 + 5 + 293 = 300 raw bytes → 400 base64 chars.
        let password = "p".repeat(293);
        let chunks = plain_payload_chunks("alice", &password);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[1], "+");
    }

    #[test]
    fn long_payload_is_split() {
        let password = "p".repeat(400);
        let chunks = plain_payload_chunks("alice", &password);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        assert_ne!(chunks.last().map(|s| s.as_str()), Some("+"));
        let joined: String = chunks.concat();
        let decoded = base64::engine::general_purpose::STANDARD.decode(joined).unwrap();
        assert_eq!(decoded.len(), 2 + 5 + 400);
    }

    #[tokio::test]
    async fn plain_success_records_account() {
        let (mut link, server) = scripted(&[
            "AUTHENTICATE +",
            ":srv 900 alice alice!a@host alice :You are now logged in as alice",
            ":srv 903 alice :SASL authentication successful",
        ])
        .await;
        let auth = {
            let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
            AuthNegotiator::new()
                .authenticate_plain(&mut wire, "alice", "hunter2")
                .await
                .unwrap()
        };
        assert_eq!(auth.account.as_deref(), Some("alice"));
        let lines = written(link, server).await;
        assert_eq!(lines[0], "AUTHENTICATE PLAIN");
        assert_eq!(lines[1], format!("AUTHENTICATE {}", plain_payload_chunks("alice", "hunter2")[0]));
    }

    #[tokio::test]
    async fn rejection_is_an_error() {
        let (mut link, _server) = scripted(&[
            "AUTHENTICATE +",
            ":srv 904 alice :SASL authentication failed",
        ])
        .await;
        let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
        let err = AuthNegotiator::new()
            .authenticate_plain(&mut wire, "alice", "wrong")
            .await
            .unwrap_err();
        match err {
            AuthError::Rejected { code, reason } => {
                assert_eq!(code, "904");
                assert_eq!(reason, "SASL authentication failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn disconnect_mid_handshake() {
        let (mut link, server) = scripted(&["AUTHENTICATE +"]).await;
        let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
        // Server reads nothing further and goes away after the continuation.
        drop(server);
        let err = AuthNegotiator::new()
            .authenticate_plain(&mut wire, "alice", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Disconnected | AuthError::Transport(_)));
    }
}
