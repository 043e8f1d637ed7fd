//! CAP capability negotiation (client side).
//!
//! `CAP LS 302` → (continuation lines) → `CAP REQ` → `ACK`/`NAK` → `CAP END`.
//! When `sasl` is acknowledged the negotiator leaves `CAP END` to the caller,
//! who must authenticate first and then call [`CapabilityNegotiator::finish`].

use std::collections::BTreeSet;

use crate::error::{HandshakeError, HandshakePhase};
use crate::irc::Message;
use crate::transport::Wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapState {
    Idle,
    Listing,
    Requesting,
    Done,
}

/// Outcome of a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    /// Capability names the server advertised, in advertised order.
    pub offered: Vec<String>,
    /// Capabilities the server acknowledged.
    pub enabled: BTreeSet<String>,
}

impl Negotiated {
    pub fn has(&self, cap: &str) -> bool {
        self.enabled.contains(cap)
    }
}

#[derive(Debug)]
pub struct CapabilityNegotiator {
    state: CapState,
}

impl Default for CapabilityNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityNegotiator {
    pub fn new() -> Self {
        Self {
            state: CapState::Idle,
        }
    }

    pub fn state(&self) -> CapState {
        self.state
    }

    /// Open negotiation. Registration lines may be sent right after this.
    pub(crate) async fn start(&mut self, wire: &mut Wire<'_>) -> Result<(), HandshakeError> {
        wire.send(&Message::new("CAP", &["LS", "302"])).await?;
        self.state = CapState::Listing;
        Ok(())
    }

    /// Collect the server's list, request the intersection with `wanted` and
    /// wait for the verdict. Non-CAP traffic is deferred to the dispatcher.
    pub(crate) async fn negotiate(
        &mut self,
        wire: &mut Wire<'_>,
        wanted: &BTreeSet<String>,
    ) -> Result<Negotiated, HandshakeError> {
        if self.state == CapState::Idle {
            self.start(wire).await?;
        }

        let mut offered: Vec<String> = Vec::new();
        loop {
            let msg = next_message(wire).await?;
            if msg.command != "CAP" {
                wire.defer(msg);
                continue;
            }
            if !subcommand_is(&msg, "LS") {
                tracing::debug!(line = %msg, "ignoring CAP reply while listing");
                continue;
            }
            // CAP <nick> LS * :caps   (more to come)
            // CAP <nick> LS :caps     (last line)
            let more = msg.params.len() >= 4 && msg.param(2) == Some("*");
            let list = msg.params.last().map(|s| s.as_str()).unwrap_or("");
            for token in list.split_whitespace() {
                let name = token.split('=').next().unwrap_or(token);
                if !name.is_empty() && !offered.iter().any(|c| c == name) {
                    offered.push(name.to_string());
                }
            }
            if !more {
                break;
            }
        }

        let request: Vec<&str> = offered
            .iter()
            .filter(|c| wanted.contains(c.as_str()))
            .map(|c| c.as_str())
            .collect();

        if request.is_empty() {
            tracing::debug!("No caps to request, sending CAP END");
            self.finish(wire).await?;
            return Ok(Negotiated {
                offered,
                enabled: BTreeSet::new(),
            });
        }

        self.state = CapState::Requesting;
        let req = request.join(" ");
        wire.send(&Message::new("CAP", &["REQ", &req])).await?;

        let enabled = loop {
            let msg = next_message(wire).await?;
            if msg.command != "CAP" {
                wire.defer(msg);
                continue;
            }
            if subcommand_is(&msg, "ACK") {
                let acked = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                break acked
                    .split_whitespace()
                    .filter(|c| !c.starts_with('-'))
                    .map(|c| c.to_string())
                    .collect::<BTreeSet<_>>();
            }
            if subcommand_is(&msg, "NAK") {
                tracing::warn!(requested = %req, "Capabilities rejected, continuing without them");
                break BTreeSet::new();
            }
        };

        if !enabled.contains("sasl") {
            self.finish(wire).await?;
        }
        tracing::info!(caps = ?enabled, "Capabilities negotiated");
        Ok(Negotiated { offered, enabled })
    }

    /// Send `CAP END` once. Further calls are no-ops.
    pub(crate) async fn finish(&mut self, wire: &mut Wire<'_>) -> Result<(), HandshakeError> {
        if self.state != CapState::Done {
            wire.send(&Message::new("CAP", &["END"])).await?;
            self.state = CapState::Done;
        }
        Ok(())
    }
}

fn subcommand_is(msg: &Message, sub: &str) -> bool {
    msg.param(1).is_some_and(|s| s.eq_ignore_ascii_case(sub))
}

async fn next_message(wire: &mut Wire<'_>) -> Result<Message, HandshakeError> {
    wire.recv()
        .await?
        .ok_or(HandshakeError::Disconnected(HandshakePhase::Capabilities))
}
