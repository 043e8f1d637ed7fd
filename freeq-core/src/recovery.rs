//! Reconnect recovery.
//!
//! Once a new transport is open, the session must get back to where it was
//! before the drop: re-register, re-join every channel in a single `JOIN`,
//! catch up each buffer through `CHATHISTORY`, rebuild the `MONITOR` list
//! from scratch and restore voice. Only one recovery runs at a time; a
//! second trigger while one is in flight is dropped.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RecoveryError;
use crate::event::Event;
use crate::host::MonitorChange;
use crate::irc::Message;
use crate::msgid;
use crate::session::{ConnectionSession, ConnectionState};
use crate::store::{HistoryDirection, MessageKind};
use crate::transport::TransportLink;

/// Single-flight latch for recovery.
#[derive(Debug, Default)]
pub(crate) struct RecoveryFlag(AtomicBool);

impl RecoveryFlag {
    /// Take the latch, or `None` if a recovery is already running.
    pub fn try_acquire(&self) -> Option<RecoveryGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecoveryGuard(&self.0))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the latch on drop, whichever way recovery ends.
pub(crate) struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What [`ConnectionSession::on_reconnected`] did with a new transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The session is `Ready` again.
    Recovered,
    /// Another recovery was already running; this transport was ignored.
    Dropped,
    /// The session is closed or has no credentials to register with.
    Aborted,
    /// A step failed. The session stays `Reconnecting` and may be retried.
    Failed,
}

impl ConnectionSession {
    /// Recover the session over a freshly opened transport.
    pub async fn on_reconnected(&self, link: TransportLink) -> RecoveryOutcome {
        if self.is_closed() {
            return RecoveryOutcome::Aborted;
        }
        let Some(_guard) = self.inner.recovery.try_acquire() else {
            tracing::debug!("Recovery already in flight, dropping trigger");
            return RecoveryOutcome::Dropped;
        };

        match self.recover(link).await {
            Ok(outcome) => outcome,
            Err(e) if self.is_closed() => {
                tracing::debug!(error = %e, "Recovery interrupted by close");
                RecoveryOutcome::Aborted
            }
            Err(e) => {
                let attempt = self.current_attempt();
                tracing::warn!(attempt, error = %e, "Recovery failed");
                self.set_state(ConnectionState::Reconnecting { attempt });
                self.inner.host.on_error(&format!("Reconnect failed: {e}"));
                RecoveryOutcome::Failed
            }
        }
    }

    /// Whether a recovery is currently running.
    pub fn is_recovering(&self) -> bool {
        self.inner.recovery.is_held()
    }

    async fn recover(&self, link: TransportLink) -> Result<RecoveryOutcome, RecoveryError> {
        self.inner.dispatch.lock().reset_transient();
        self.inner.refresher.cancel();
        self.attach(link).await;

        let Some(credentials) = self.inner.credentials.lock().clone() else {
            tracing::warn!("No credentials to recover with");
            return Ok(RecoveryOutcome::Aborted);
        };
        let registration = self.handshake(&credentials).await?;
        if self.is_closed() {
            return Ok(RecoveryOutcome::Aborted);
        }
        self.apply_registration(registration).await;
        self.refresh_token().await;

        self.rejoin().await?;
        self.catch_up().await?;
        if self.is_closed() {
            return Ok(RecoveryOutcome::Aborted);
        }
        self.resubscribe_presence().await?;

        self.inner
            .host
            .restore_voice()
            .await
            .map_err(|e| RecoveryError::Voice(format!("{e:#}")))?;

        if self.is_closed() {
            return Ok(RecoveryOutcome::Aborted);
        }
        self.mark_recovered();
        self.inner.host.on_error_cleared();
        self.emit(Event::RecoveryCompleted);
        tracing::info!("Recovery complete");
        Ok(RecoveryOutcome::Recovered)
    }

    /// One `JOIN` for every channel; the self-join echoes are not announced.
    async fn rejoin(&self) -> Result<(), RecoveryError> {
        let channels = {
            let mut dispatch = self.inner.dispatch.lock();
            let channels = dispatch.roster.channel_names();
            dispatch.suppress_self_joins(channels.len());
            channels
        };
        if channels.is_empty() {
            return Ok(());
        }
        tracing::info!(count = channels.len(), "Rejoining channels");
        self.send(&Message::new("JOIN", &[&channels.join(",")]))
            .await?;
        Ok(())
    }

    /// Fetch what was missed in each joined channel, after the newest
    /// server-confirmed message or the latest page for an empty buffer.
    async fn catch_up(&self) -> Result<(), RecoveryError> {
        let (channels, page) = {
            let dispatch = self.inner.dispatch.lock();
            if !dispatch.chathistory() {
                return Ok(());
            }
            (dispatch.roster.channel_names(), dispatch.page_size())
        };
        let limit = page.to_string();
        for channel in channels {
            let anchor = self
                .store()
                .get_messages(&channel)
                .into_iter()
                .rev()
                .find(|m| m.kind == MessageKind::Chat && !msgid::is_local(&m.msgid))
                .map(|m| format!("msgid={}", m.msgid));
            let msg = match &anchor {
                Some(anchor) => Message::new("CHATHISTORY", &["AFTER", &channel, anchor, &limit]),
                None => Message::new("CHATHISTORY", &["LATEST", &channel, "*", &limit]),
            };
            self.inner
                .dispatch
                .lock()
                .expect_history(&channel, HistoryDirection::Forward);
            self.send(&msg).await?;
        }
        Ok(())
    }

    /// `MONITOR C` followed by the full desired set.
    async fn resubscribe_presence(&self) -> Result<(), RecoveryError> {
        let nicks = self.inner.dispatch.lock().roster.resubscribe_monitor();
        self.send(&Message::new("MONITOR", &["C"])).await?;
        self.inner.host.on_monitor_changed(&MonitorChange::Cleared);
        if !nicks.is_empty() {
            self.send(&Message::new("MONITOR", &["+", &nicks.join(",")]))
                .await?;
            self.inner
                .host
                .on_monitor_changed(&MonitorChange::Added(nicks));
        }
        Ok(())
    }
}
