//! Connection lifecycle.
//!
//! A [`ConnectionSession`] owns one logical connection: it opens transports
//! through the injected [`Connector`], runs the CAP/SASL/registration
//! handshake, pumps inbound lines through the dispatcher into the
//! [`ChannelMessageStore`], and exposes the outbound operations a client
//! needs. Reconnect recovery lives in [`crate::recovery`].
//!
//! ## States
//!
//! `Disconnected → Connecting → CapNegotiating → (Authenticating) → Ready`.
//! Losing the transport moves a ready session to `Reconnecting { attempt }`;
//! recovery walks it back through the handshake states to `Ready`. `close()`
//! is terminal.
//!
//! ## Reconnection
//!
//! [`ConnectionSession::run_with_reconnect`] drives everything: it pumps the
//! current transport, and when it drops, retries with exponential backoff
//! (2→4→8→16→30s cap by default) and runs recovery on each new transport.
//! Hosts with their own transport supervision can call
//! [`ConnectionSession::on_transport_lost`] and
//! [`ConnectionSession::on_reconnected`] directly instead.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};

use crate::cap::CapabilityNegotiator;
use crate::config::{Credentials, SessionConfig};
use crate::dispatch::{Dispatcher, Outcome};
use crate::error::{HandshakeError, HandshakePhase, SessionError, TransportError};
use crate::event::Event;
use crate::host::{
    BearerToken, CredentialStore, ServerConfig, ServerConfigSource, SessionHost, TokenIssuer,
};
use crate::irc::{self, Message};
use crate::msgid;
use crate::presence::is_channel;
use crate::recovery::{RecoveryFlag, RecoveryOutcome};
use crate::sasl::AuthNegotiator;
use crate::store::{ChannelMessageStore, ChatMessage, HistoryDirection, SendState};
use crate::token::TokenRefresher;
use crate::transport::{Connector, LineSink, LineStream, TransportLink, Wire};

/// Alternate nicks tried after `433` before giving up.
const MAX_NICK_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    CapNegotiating,
    Authenticating,
    Ready,
    Reconnecting { attempt: u32 },
}

/// Optional REST-side collaborators.
#[derive(Clone, Default)]
pub struct SessionServices {
    pub token_issuer: Option<Arc<dyn TokenIssuer>>,
    pub credential_store: Option<Arc<dyn CredentialStore>>,
    pub server_config: Option<Arc<dyn ServerConfigSource>>,
}

/// What a completed handshake established.
pub(crate) struct Registration {
    pub nick: String,
    pub account: Option<String>,
    pub caps: BTreeSet<String>,
    /// Lines that arrived during the handshake and still need dispatching.
    pub backlog: Vec<Message>,
}

pub(crate) struct SessionInner {
    pub config: SessionConfig,
    pub connector: Arc<dyn Connector>,
    pub host: Arc<dyn SessionHost>,
    pub services: SessionServices,
    state: parking_lot::Mutex<ConnectionState>,
    sink: tokio::sync::Mutex<Option<Box<dyn LineSink>>>,
    stream: tokio::sync::Mutex<Option<Box<dyn LineStream>>>,
    pub credentials: parking_lot::Mutex<Option<Credentials>>,
    pub dispatch: parking_lot::Mutex<Dispatcher>,
    pub store: parking_lot::Mutex<ChannelMessageStore>,
    server_config: parking_lot::Mutex<Option<ServerConfig>>,
    pub token: parking_lot::Mutex<Option<BearerToken>>,
    pub recovery: RecoveryFlag,
    pub refresher: TokenRefresher,
    events: mpsc::UnboundedSender<Event>,
    closed: AtomicBool,
    attempt: AtomicU32,
    shutdown: Notify,
}

/// Handle to a logical connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionSession {
    /// Create a session. Returns it with the receiver for its [`Event`]s.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        host: Arc<dyn SessionHost>,
        services: SessionServices,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = SessionInner {
            store: parking_lot::Mutex::new(ChannelMessageStore::new(config.buffer_capacity)),
            dispatch: parking_lot::Mutex::new(Dispatcher::new(config.history_page_size)),
            config,
            connector,
            host,
            services,
            state: parking_lot::Mutex::new(ConnectionState::Disconnected),
            sink: tokio::sync::Mutex::new(None),
            stream: tokio::sync::Mutex::new(None),
            credentials: parking_lot::Mutex::new(None),
            server_config: parking_lot::Mutex::new(None),
            token: parking_lot::Mutex::new(None),
            recovery: RecoveryFlag::default(),
            refresher: TokenRefresher::default(),
            events,
            closed: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            shutdown: Notify::new(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        )
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The conversation store. Do not hold the guard across an `.await`.
    pub fn store(&self) -> parking_lot::MutexGuard<'_, ChannelMessageStore> {
        self.inner.store.lock()
    }

    pub fn own_nick(&self) -> String {
        self.inner.dispatch.lock().roster.own_nick().to_string()
    }

    pub fn joined_channels(&self) -> Vec<String> {
        self.inner.dispatch.lock().roster.channel_names()
    }

    pub fn members(&self, channel: &str) -> Vec<String> {
        self.inner.dispatch.lock().roster.members(channel)
    }

    pub fn monitored_nicks(&self) -> Vec<String> {
        self.inner.dispatch.lock().roster.monitored().nicks()
    }

    pub fn server_config(&self) -> Option<ServerConfig> {
        self.inner.server_config.lock().clone()
    }

    pub fn bearer_token(&self) -> Option<BearerToken> {
        self.inner.token.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Once closed, only `Disconnected` is accepted. The flag is read under
    /// the state lock so a racing transition cannot land after `close()`.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.inner.state.lock();
            if state != ConnectionState::Disconnected && self.is_closed() {
                tracing::debug!(?state, "Session closed, ignoring transition");
                return;
            }
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            tracing::info!(?state, "Session state changed");
            self.emit(Event::StateChanged { state });
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn current_attempt(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst).max(1)
    }

    fn next_attempt(&self) -> u32 {
        let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Reconnecting { attempt });
        attempt
    }

    pub(crate) fn mark_recovered(&self) {
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Ready);
    }

    // ── Connect ──────────────────────────────────────────────────

    /// Open a transport, negotiate, authenticate and register.
    ///
    /// On failure the error is reported through
    /// [`SessionHost::on_error`], the session stays `Disconnected` and the
    /// connect is not retried.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.state() != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        *self.inner.credentials.lock() = Some(credentials.clone());
        self.set_state(ConnectionState::Connecting);

        let registration = match self.establish(&credentials).await {
            Ok(registration) => registration,
            Err(_) if self.is_closed() => return Err(SessionError::Closed),
            Err(e) => {
                tracing::warn!(error = %e, "Connect failed");
                self.detach().await;
                self.set_state(ConnectionState::Disconnected);
                self.inner.host.on_error(&e.to_string());
                self.emit(Event::Disconnected {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let nick = registration.nick.clone();
        self.apply_registration(registration).await;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.mark_recovered();
        self.inner.host.on_welcome(&nick);

        self.refresh_token().await;
        self.load_server_config().await;
        Ok(())
    }

    /// Connect with the login from the injected [`CredentialStore`].
    pub async fn connect_saved(&self) -> Result<(), SessionError> {
        let credentials = self
            .inner
            .services
            .credential_store
            .as_ref()
            .and_then(|store| store.load())
            .ok_or(SessionError::NoCredentials)?;
        self.connect(credentials).await
    }

    async fn establish(&self, credentials: &Credentials) -> Result<Registration, SessionError> {
        let link = self.inner.connector.connect().await?;
        self.attach(link).await;
        Ok(self.handshake(credentials).await?)
    }

    /// Make `link` the session's transport.
    pub(crate) async fn attach(&self, link: TransportLink) {
        let TransportLink { sink, stream } = link;
        *self.inner.sink.lock().await = Some(sink);
        *self.inner.stream.lock().await = Some(stream);
        self.inner.host.on_connection_created();
        self.emit(Event::Connected);
    }

    async fn detach(&self) {
        *self.inner.sink.lock().await = None;
        *self.inner.stream.lock().await = None;
    }

    /// CAP negotiation with `NICK`/`USER` sent alongside, SASL when there is
    /// a password and the server acknowledged `sasl`, then `CAP END` and the
    /// wait for `001`. Each phase is bounded by its configured timeout.
    pub(crate) async fn handshake(
        &self,
        credentials: &Credentials,
    ) -> Result<Registration, HandshakeError> {
        let config = &self.inner.config;
        let mut sink = self.inner.sink.lock().await;
        let mut stream = self.inner.stream.lock().await;
        let (Some(sink), Some(stream)) = (sink.as_deref_mut(), stream.as_deref_mut()) else {
            return Err(TransportError::NotConnected.into());
        };
        let mut wire = Wire::new(sink, stream);
        let mut cap = CapabilityNegotiator::new();

        self.set_state(ConnectionState::CapNegotiating);
        let wanted = config.wanted_caps(credentials);
        let negotiated = bounded(HandshakePhase::Capabilities, config.cap_timeout(), async {
            cap.start(&mut wire).await?;
            register(&mut wire, &credentials.nick, config).await?;
            let negotiated = cap.negotiate(&mut wire, &wanted).await?;
            Ok::<_, HandshakeError>(negotiated)
        })
        .await?;

        let mut account = None;
        if let Some(password) = credentials.password.as_deref() {
            if negotiated.has("sasl") {
                self.set_state(ConnectionState::Authenticating);
                let login = credentials.sasl_account();
                let authenticated =
                    bounded(HandshakePhase::Authentication, config.sasl_timeout(), async {
                        let authenticated = AuthNegotiator::new()
                            .authenticate_plain(&mut wire, login, password)
                            .await?;
                        Ok::<_, HandshakeError>(authenticated)
                    })
                    .await?;
                account = Some(authenticated.account.unwrap_or_else(|| login.to_string()));
                self.emit(Event::Authenticated {
                    account: account.clone(),
                });
            } else {
                tracing::warn!("Server did not acknowledge sasl, continuing unauthenticated");
            }
        }

        cap.finish(&mut wire).await?;
        let nick = bounded(
            HandshakePhase::Registration,
            config.registration_timeout(),
            await_welcome(&mut wire, &credentials.nick),
        )
        .await?;

        tracing::info!(%nick, "Registered");
        Ok(Registration {
            nick,
            account,
            caps: negotiated.enabled,
            backlog: std::mem::take(&mut wire.backlog),
        })
    }

    pub(crate) async fn apply_registration(&self, registration: Registration) {
        let Registration {
            nick,
            account,
            caps,
            backlog,
        } = registration;
        self.inner
            .dispatch
            .lock()
            .apply_registration(&nick, account.as_deref(), &caps);
        self.emit(Event::Registered { nick });
        for msg in backlog {
            self.handle_message(msg).await;
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    pub(crate) async fn handle_message(&self, msg: Message) {
        let outcome = {
            let mut dispatch = self.inner.dispatch.lock();
            let mut store = self.inner.store.lock();
            dispatch.handle(msg, &mut store)
        };
        self.carry_out(outcome).await;
    }

    async fn carry_out(&self, outcome: Outcome) {
        for reply in &outcome.replies {
            if let Err(e) = self.send(reply).await {
                tracing::debug!(error = %e, "Dropping reply");
            }
        }
        for channel in &outcome.invalidated {
            self.inner.host.on_members_invalidated(channel);
        }
        for change in &outcome.monitor {
            self.inner.host.on_monitor_changed(change);
        }
        for event in outcome.events {
            self.emit(event);
        }
    }

    /// Read and dispatch one inbound line. Returns `false` once the peer
    /// closed the transport.
    pub async fn pump(&self) -> Result<bool, SessionError> {
        let line = {
            let mut stream = self.inner.stream.lock().await;
            let stream = stream
                .as_deref_mut()
                .ok_or(TransportError::NotConnected)?;
            stream.recv_line().await?
        };
        let Some(line) = line else {
            return Ok(false);
        };
        match Message::parse(&line) {
            Some(msg) => self.handle_message(msg).await,
            None => tracing::debug!(line = %line, "Dropping malformed line"),
        }
        Ok(true)
    }

    /// Pump until the transport closes or the session is closed.
    pub async fn run(&self) -> Result<(), SessionError> {
        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                more = self.pump() => {
                    if !more? {
                        return Ok(());
                    }
                }
                _ = self.inner.shutdown.notified() => break,
            }
        }
        *self.inner.stream.lock().await = None;
        Ok(())
    }

    /// Record that the transport dropped: `Reconnecting { attempt: 1 }`.
    ///
    /// Must not be called while [`run`](Self::run) is pumping.
    pub async fn on_transport_lost(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.detach().await;
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.next_attempt();
        self.inner.host.on_error(&format!("Connection lost: {reason}"));
        self.emit(Event::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Pump the connection; on transport loss reconnect with backoff and
    /// recover. Returns when the session is closed.
    pub async fn run_with_reconnect(&self) -> Result<(), SessionError> {
        loop {
            let reason = match self.run().await {
                Ok(()) => "connection closed by server".to_string(),
                Err(e) => e.to_string(),
            };
            if self.is_closed() {
                return Ok(());
            }
            tracing::warn!(%reason, "Transport lost");
            self.on_transport_lost(&reason).await;
            self.reconnect().await?;
        }
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        let backoff = &self.inner.config.reconnect;
        let mut delay = backoff.initial_delay();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.notified() => return Ok(()),
            }
            if self.is_closed() {
                return Ok(());
            }
            let attempt = self.current_attempt();
            tracing::info!(attempt, ?delay, "Reconnecting");
            match self.inner.connector.connect().await {
                Ok(link) => match self.on_reconnected(link).await {
                    RecoveryOutcome::Recovered | RecoveryOutcome::Dropped => return Ok(()),
                    RecoveryOutcome::Aborted if self.is_closed() => return Ok(()),
                    RecoveryOutcome::Aborted => return Err(SessionError::NoCredentials),
                    RecoveryOutcome::Failed => {}
                },
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnect failed"),
            }
            self.next_attempt();
            delay = backoff.next_delay(delay);
        }
    }

    /// Quit and tear down. The session cannot be reused.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        self.inner.refresher.cancel();
        if let Err(e) = self.send(&Message::new("QUIT", &["Leaving"])).await {
            tracing::debug!(error = %e, "QUIT not sent");
        }
        *self.inner.sink.lock().await = None;
        // A running `pump` holds the stream; `run` drops it on its way out.
        if let Ok(mut stream) = self.inner.stream.try_lock() {
            *stream = None;
        }
        self.inner.dispatch.lock().reset();
        self.inner.store.lock().reset_all();
        *self.inner.token.lock() = None;
        self.set_state(ConnectionState::Disconnected);
        self.emit(Event::Disconnected {
            reason: "closed".to_string(),
        });
    }

    // ── Post-registration services ───────────────────────────────

    async fn load_server_config(&self) {
        let Some(source) = self.inner.services.server_config.clone() else {
            return;
        };
        let config = match source.fetch(&self.inner.config.server_url).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Server config fetch failed");
                return;
            }
        };
        let defaults = if self.joined_channels().is_empty() {
            config.default_channels.clone()
        } else {
            Vec::new()
        };
        *self.inner.server_config.lock() = Some(config);
        if !defaults.is_empty()
            && let Err(e) = self.join(&defaults.join(",")).await
        {
            tracing::warn!(error = %e, "Joining default channels failed");
        }
    }

    // ── Outbound ─────────────────────────────────────────────────

    pub(crate) async fn send(&self, msg: &Message) -> Result<(), SessionError> {
        let line = msg.to_string();
        let mut sink = self.inner.sink.lock().await;
        let sink = sink.as_deref_mut().ok_or(TransportError::NotConnected)?;
        tracing::debug!(line = %line, "send");
        sink.send_line(&line).await?;
        Ok(())
    }

    fn echo_enabled(&self) -> bool {
        self.inner.dispatch.lock().echo_message()
    }

    pub async fn join(&self, channel: &str) -> Result<(), SessionError> {
        self.send(&checked("JOIN", &[channel])?).await
    }

    pub async fn part(&self, channel: &str, reason: Option<&str>) -> Result<(), SessionError> {
        let msg = match reason {
            Some(reason) => checked("PART", &[channel, reason])?,
            None => checked("PART", &[channel])?,
        };
        self.send(&msg).await
    }

    pub async fn who(&self, target: &str) -> Result<(), SessionError> {
        self.send(&checked("WHO", &[target])?).await
    }

    /// Send a message and render it immediately as a `Sending` local copy.
    /// Returns the local id. The server's echo replaces the copy; without
    /// `echo-message` it is marked `Sent` once written.
    pub async fn send_message(&self, target: &str, text: &str) -> Result<String, SessionError> {
        self.send_chat(target, text, None).await
    }

    /// Send a reply to a specific message (adds `+draft/reply`).
    pub async fn reply(
        &self,
        target: &str,
        parent_msgid: &str,
        text: &str,
    ) -> Result<String, SessionError> {
        self.send_chat(target, text, Some(parent_msgid)).await
    }

    async fn send_chat(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, SessionError> {
        let mut msg = checked("PRIVMSG", &[target, text])?;
        if let Some(parent) = reply_to {
            msg = msg.with_tag("+draft/reply", parent);
        }

        let local_id = msgid::local();
        let mut local = ChatMessage::chat(&local_id, &self.own_nick(), target, text);
        local.reply_to = reply_to.map(str::to_string);
        local.send_state = Some(SendState::Sending);
        self.inner.store.lock().add_message(target, local.clone());
        self.emit(Event::Message {
            target: target.to_string(),
            message: local,
        });
        if !is_channel(target) {
            let outcome = self.inner.dispatch.lock().open_dm(target);
            self.carry_out(outcome).await;
        }

        let result = self.send(&msg).await;
        let state = match &result {
            Err(_) => Some(SendState::Failed),
            Ok(()) if !self.echo_enabled() => Some(SendState::Sent),
            Ok(()) => None,
        };
        if let Some(state) = state {
            let changed = self
                .inner
                .store
                .lock()
                .update_send_state(target, &local_id, state);
            if changed {
                self.emit(Event::SendStateChanged {
                    target: target.to_string(),
                    msgid: local_id.clone(),
                    state,
                });
            }
        }
        result.map(|()| local_id)
    }

    /// React to a message with an emoji.
    pub async fn react(&self, target: &str, msgid: &str, emoji: &str) -> Result<(), SessionError> {
        let msg = checked("TAGMSG", &[target])?
            .with_tag("+draft/react", emoji)
            .with_tag("+draft/reply", msgid);
        self.send(&msg).await?;
        if !self.echo_enabled() {
            let actor = self.inner.dispatch.lock().actor();
            let changed = self
                .inner
                .store
                .lock()
                .add_reaction(target, msgid, emoji, &actor);
            if changed {
                self.emit(Event::ReactionsChanged {
                    target: target.to_string(),
                    msgid: msgid.to_string(),
                });
            }
        }
        Ok(())
    }

    pub async fn unreact(&self, target: &str, msgid: &str, emoji: &str) -> Result<(), SessionError> {
        let msg = checked("TAGMSG", &[target])?
            .with_tag("+draft/unreact", emoji)
            .with_tag("+draft/reply", msgid);
        self.send(&msg).await?;
        if !self.echo_enabled() {
            let actor = self.inner.dispatch.lock().actor();
            let changed = self
                .inner
                .store
                .lock()
                .remove_reaction(target, msgid, emoji, &actor);
            if changed {
                self.emit(Event::ReactionsChanged {
                    target: target.to_string(),
                    msgid: msgid.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Edit a previously sent message. `msgid` is the id the message was
    /// first seen with.
    pub async fn edit_message(
        &self,
        target: &str,
        msgid: &str,
        new_text: &str,
    ) -> Result<(), SessionError> {
        let msg = checked("PRIVMSG", &[target, new_text])?.with_tag("+draft/edit", msgid);
        self.send(&msg).await?;
        if !self.echo_enabled() {
            let new_msgid = msgid::local();
            let changed = self
                .inner
                .store
                .lock()
                .update_message_text(target, msgid, new_text, &new_msgid);
            if changed {
                self.emit(Event::MessageEdited {
                    target: target.to_string(),
                    msgid: msgid.to_string(),
                    new_msgid,
                });
            }
        }
        Ok(())
    }

    /// Delete a previously sent message (via `TAGMSG`).
    pub async fn delete_message(&self, target: &str, msgid: &str) -> Result<(), SessionError> {
        let msg = checked("TAGMSG", &[target])?.with_tag("+draft/delete", msgid);
        self.send(&msg).await?;
        if !self.echo_enabled() && self.inner.store.lock().redact_message(target, msgid) {
            self.emit(Event::MessageRedacted {
                target: target.to_string(),
                msgid: msgid.to_string(),
            });
        }
        Ok(())
    }

    pub async fn pin(&self, channel: &str, msgid: &str) -> Result<(), SessionError> {
        self.send(&checked("PIN", &[channel, msgid])?).await
    }

    pub async fn unpin(&self, channel: &str, msgid: &str) -> Result<(), SessionError> {
        self.send(&checked("UNPIN", &[channel, msgid])?).await
    }

    /// Request the latest `count` messages (CHATHISTORY LATEST).
    pub async fn history_latest(&self, target: &str, count: usize) -> Result<(), SessionError> {
        let limit = count.to_string();
        let msg = checked("CHATHISTORY", &["LATEST", target, "*", &limit])?;
        self.request_history(target, HistoryDirection::Forward, &msg).await
    }

    /// Request `count` messages before `msgid` (CHATHISTORY BEFORE).
    pub async fn history_before(
        &self,
        target: &str,
        msgid: &str,
        count: usize,
    ) -> Result<(), SessionError> {
        let (anchor, limit) = (format!("msgid={msgid}"), count.to_string());
        let msg = checked("CHATHISTORY", &["BEFORE", target, &anchor, &limit])?;
        self.request_history(target, HistoryDirection::Backward, &msg).await
    }

    /// Request `count` messages after `msgid` (CHATHISTORY AFTER).
    pub async fn history_after(
        &self,
        target: &str,
        msgid: &str,
        count: usize,
    ) -> Result<(), SessionError> {
        let (anchor, limit) = (format!("msgid={msgid}"), count.to_string());
        let msg = checked("CHATHISTORY", &["AFTER", target, &anchor, &limit])?;
        self.request_history(target, HistoryDirection::Forward, &msg).await
    }

    /// Page backwards from the oldest buffered message, or fetch the latest
    /// page when nothing server-confirmed is buffered yet.
    pub async fn load_older(&self, target: &str) -> Result<(), SessionError> {
        let count = self.inner.config.history_page_size;
        let oldest = self
            .store()
            .cursors(target)
            .oldest_msgid
            .filter(|id| !msgid::is_local(id));
        match oldest {
            Some(id) => self.history_before(target, &id, count).await,
            None => self.history_latest(target, count).await,
        }
    }

    async fn request_history(
        &self,
        target: &str,
        direction: HistoryDirection,
        msg: &Message,
    ) -> Result<(), SessionError> {
        // Registered first: the reply may be dispatched before send returns.
        self.inner.dispatch.lock().expect_history(target, direction);
        self.send(msg).await
    }

    /// Sync our read position (MARKREAD).
    pub async fn mark_read(&self, target: &str, at: DateTime<Utc>) -> Result<(), SessionError> {
        let stamp = format!(
            "timestamp={}",
            at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        self.send(&checked("MARKREAD", &[target, &stamp])?).await
    }

    /// Send a typing indicator (`+typing=active` / `done`).
    pub async fn typing(&self, target: &str, active: bool) -> Result<(), SessionError> {
        let state = if active { "active" } else { "done" };
        let msg = checked("TAGMSG", &[target])?.with_tag("+typing", state);
        self.send(&msg).await
    }
}

/// Build an outbound message from caller-supplied params, rejecting anything
/// that cannot be framed.
fn checked(command: &str, params: &[&str]) -> Result<Message, SessionError> {
    Message::encode(command, params)?;
    Ok(Message::new(command, params))
}

async fn bounded<T>(
    phase: HandshakePhase,
    after: Duration,
    fut: impl Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%phase, ?after, "Handshake phase timed out");
            Err(HandshakeError::Timeout { phase, after })
        }
    }
}

async fn register(
    wire: &mut Wire<'_>,
    nick: &str,
    config: &SessionConfig,
) -> Result<(), TransportError> {
    wire.send(&Message::new("NICK", &[nick])).await?;
    wire.send(&Message::new("USER", &[&config.user, "0", "*", &config.realname]))
        .await
}

/// Wait for `001`, trying `nick1`…`nick5` on `433`. Lines deferred by the
/// earlier phases are checked first, since `433` often arrives during CAP.
async fn await_welcome(wire: &mut Wire<'_>, nick: &str) -> Result<String, HandshakeError> {
    let mut early = std::mem::take(&mut wire.backlog).into_iter();
    let mut tries = 0u32;
    loop {
        let msg = match early.next() {
            Some(msg) => msg,
            None => wire
                .recv()
                .await?
                .ok_or(HandshakeError::Disconnected(HandshakePhase::Registration))?,
        };
        match msg.command.as_str() {
            irc::RPL_WELCOME => {
                wire.backlog.extend(early);
                return Ok(msg.param(0).unwrap_or(nick).to_string());
            }
            irc::ERR_NICKNAMEINUSE => {
                tries += 1;
                if tries > MAX_NICK_RETRIES {
                    return Err(HandshakeError::NickRejected(format!("{nick} is in use")));
                }
                let alt = format!("{nick}{tries}");
                tracing::info!(%alt, "Nickname in use, retrying");
                wire.send(&Message::new("NICK", &[&alt])).await?;
            }
            irc::ERR_ERRONEUSNICKNAME => {
                let reason = msg.params.last().cloned().unwrap_or_default();
                return Err(HandshakeError::NickRejected(reason));
            }
            "ERROR" => return Err(HandshakeError::Refused(msg.params.join(" "))),
            _ => wire.defer(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{scripted, written};

    #[tokio::test]
    async fn nick_collision_retries_with_suffix() {
        let (mut link, server) = scripted(&[
            ":srv 433 * alice :Nickname is already in use",
            ":srv 433 * alice1 :Nickname is already in use",
            ":srv NOTICE alice2 :hi",
            ":srv 001 alice2 :Welcome",
        ])
        .await;
        let (nick, backlog) = {
            let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
            let nick = await_welcome(&mut wire, "alice").await.unwrap();
            (nick, wire.backlog)
        };
        assert_eq!(nick, "alice2");
        assert_eq!(backlog.len(), 1);
        assert_eq!(written(link, server).await, vec!["NICK alice1", "NICK alice2"]);
    }

    #[tokio::test]
    async fn nick_collision_gives_up() {
        let lines: Vec<String> = (0..=MAX_NICK_RETRIES)
            .map(|_| ":srv 433 * x :Nickname is already in use".to_string())
            .collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let (mut link, _server) = scripted(&refs).await;
        let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
        let err = await_welcome(&mut wire, "x").await.unwrap_err();
        assert!(matches!(err, HandshakeError::NickRejected(_)));
    }

    #[tokio::test]
    async fn early_nick_collision_in_backlog_is_seen() {
        let (mut link, _server) = scripted(&[":srv 001 bob1 :Welcome"]).await;
        let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
        wire.defer(Message::parse(":srv 433 * bob :in use").unwrap());
        assert_eq!(await_welcome(&mut wire, "bob").await.unwrap(), "bob1");
    }

    #[tokio::test]
    async fn lines_behind_an_early_welcome_stay_deferred() {
        let (mut link, _server) = scripted(&[]).await;
        let mut wire = Wire::new(link.sink.as_mut(), link.stream.as_mut());
        wire.defer(Message::parse(":srv NOTICE * :Looking up your hostname").unwrap());
        wire.defer(Message::parse(":srv 001 bob :Welcome").unwrap());
        wire.defer(Message::parse(":srv 005 bob CHANTYPES=# :are supported").unwrap());
        assert_eq!(await_welcome(&mut wire, "bob").await.unwrap(), "bob");
        let kept: Vec<&str> = wire.backlog.iter().map(|m| m.command.as_str()).collect();
        assert_eq!(kept, vec!["NOTICE", "005"]);
    }

    #[tokio::test]
    async fn bounded_reports_phase() {
        let err = bounded(
            HandshakePhase::Capabilities,
            Duration::from_millis(10),
            std::future::pending::<Result<(), HandshakeError>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Timeout {
                phase: HandshakePhase::Capabilities,
                ..
            }
        ));
    }

    #[test]
    fn checked_rejects_line_breaks() {
        assert!(checked("PRIVMSG", &["#c", "a\r\nQUIT"]).is_err());
        assert!(checked("PRIVMSG", &["#c", "hello world"]).is_ok());
    }
}
