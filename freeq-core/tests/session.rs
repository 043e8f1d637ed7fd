//! Connection lifecycle against a scripted in-memory server.
//!
//! Covers:
//! - CAP + SASL PLAIN handshake, token fetch and state transitions
//! - Guest login without SASL, and SASL rejection
//! - Handshake phase timeouts
//! - Optimistic sends reconciled by echo-message
//! - History on join, paging backwards, server defaults and close

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use base64::Engine;
use common::{DuplexConnector, FakeHost, FakeServer, FakeTokenIssuer, init_tracing};
use freeq_core::{
    AuthError, ConnectionSession, ConnectionState, Credentials, Event, ExternalServiceError,
    HandshakeError, HandshakePhase, HistoryDirection, SendState, ServerConfig,
    ServerConfigSource, SessionConfig, SessionError, SessionServices, msgid,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn states(events: &[Event]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

struct Harness {
    session: ConnectionSession,
    events: UnboundedReceiver<Event>,
    host: Arc<FakeHost>,
    server: FakeServer,
}

/// A session registered as `nick` with `caps` acknowledged.
async fn connected(nick: &str, caps: &[&str]) -> Harness {
    init_tracing();
    let (connector, mut servers) = DuplexConnector::new();
    let host = Arc::new(FakeHost::default());
    let (session, events) = ConnectionSession::new(
        SessionConfig::default(),
        Arc::new(connector),
        host.clone(),
        SessionServices::default(),
    );
    let connecting = {
        let session = session.clone();
        let creds = Credentials::guest(nick);
        tokio::spawn(async move { session.connect(creds).await })
    };
    let mut server = servers.recv().await.unwrap();
    server.handshake(nick, caps).await;
    connecting.await.unwrap().unwrap();
    Harness {
        session,
        events,
        host,
        server,
    }
}

#[tokio::test]
async fn connect_authenticates_and_fetches_token() {
    init_tracing();
    let (connector, mut servers) = DuplexConnector::new();
    let host = Arc::new(FakeHost::default());
    let issuer = Arc::new(FakeTokenIssuer::default());
    let services = SessionServices {
        token_issuer: Some(issuer.clone()),
        ..Default::default()
    };
    let (session, mut events) = ConnectionSession::new(
        SessionConfig::default(),
        Arc::new(connector),
        host.clone(),
        services,
    );

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .connect(Credentials::new("alice", "alice.example", "hunter2"))
                .await
        })
    };
    let mut server = servers.recv().await.unwrap();
    server.expect("CAP LS 302").await;
    server.expect("NICK alice").await;
    server.expect("USER freeq 0 * :freeq client").await;
    server
        .send(":srv CAP * LS :message-tags sasl echo-message")
        .await;
    server.expect("CAP REQ :message-tags sasl echo-message").await;
    server
        .send(":srv CAP * ACK :message-tags sasl echo-message")
        .await;
    server.expect("AUTHENTICATE PLAIN").await;
    server.send("AUTHENTICATE +").await;
    let payload = base64::engine::general_purpose::STANDARD.encode("\0alice.example\0hunter2");
    server.expect(&format!("AUTHENTICATE {payload}")).await;
    server
        .send(":srv 900 alice alice!u@h alice.example :You are now logged in as alice.example")
        .await;
    server.send(":srv 903 alice :SASL authentication successful").await;
    server.expect("CAP END").await;
    server.send(":srv 001 alice :Welcome to freeq").await;

    connecting.await.unwrap().unwrap();
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(session.own_nick(), "alice");
    assert_eq!(FakeHost::count(&host.welcomes), 1);
    assert_eq!(FakeHost::count(&host.connections), 1);
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.bearer_token().unwrap().token, "alice.example-0");
    assert_eq!(host.tokens.lock().len(), 1);

    let events = drain(&mut events);
    assert_eq!(
        states(&events),
        vec![
            ConnectionState::Connecting,
            ConnectionState::CapNegotiating,
            ConnectionState::Authenticating,
            ConnectionState::Ready,
        ]
    );
    assert!(events.iter().any(
        |e| matches!(e, Event::Authenticated { account: Some(a) } if a == "alice.example")
    ));
}

#[tokio::test]
async fn guest_skips_sasl_and_token() {
    let mut h = connected("bob", &["message-tags", "sasl"]).await;
    assert_eq!(h.session.state(), ConnectionState::Ready);
    assert!(h.session.bearer_token().is_none());
    let events = drain(&mut h.events);
    assert!(!states(&events).contains(&ConnectionState::Authenticating));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Registered { nick } if nick == "bob")));
}

#[tokio::test]
async fn sasl_rejection_leaves_session_disconnected() {
    init_tracing();
    let (connector, mut servers) = DuplexConnector::new();
    let host = Arc::new(FakeHost::default());
    let (session, _events) = ConnectionSession::new(
        SessionConfig::default(),
        Arc::new(connector),
        host.clone(),
        SessionServices::default(),
    );
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .connect(Credentials::new("alice", "", "wrong"))
                .await
        })
    };
    let mut server = servers.recv().await.unwrap();
    server.expect("CAP LS 302").await;
    server.recv().await;
    server.recv().await;
    server.send(":srv CAP * LS :sasl").await;
    server.expect("CAP REQ sasl").await;
    server.send(":srv CAP * ACK :sasl").await;
    server.expect("AUTHENTICATE PLAIN").await;
    server.send("AUTHENTICATE +").await;
    server.recv().await;
    server
        .send(":srv 904 alice :SASL authentication failed")
        .await;

    let err = connecting.await.unwrap().unwrap_err();
    match err {
        SessionError::Handshake(HandshakeError::Auth(AuthError::Rejected { code, .. })) => {
            assert_eq!(code, "904")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(host.errors.lock().len(), 1);
    assert_eq!(FakeHost::count(&host.welcomes), 0);
}

#[tokio::test]
async fn unanswered_cap_ls_times_out() {
    init_tracing();
    let (connector, mut servers) = DuplexConnector::new();
    let host = Arc::new(FakeHost::default());
    let config = SessionConfig {
        cap_timeout_ms: 50,
        ..SessionConfig::default()
    };
    let (session, mut events) = ConnectionSession::new(
        config,
        Arc::new(connector),
        host.clone(),
        SessionServices::default(),
    );
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(Credentials::guest("alice")).await })
    };
    let mut server = servers.recv().await.unwrap();
    server.expect("CAP LS 302").await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Handshake(HandshakeError::Timeout {
                phase: HandshakePhase::Capabilities,
                ..
            })
        ),
        "unexpected error: {err}"
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(host.errors.lock().len(), 1);
    assert_eq!(FakeHost::count(&host.welcomes), 0);
    assert_eq!(
        states(&drain(&mut events)),
        vec![
            ConnectionState::Connecting,
            ConnectionState::CapNegotiating,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn echo_confirms_optimistic_send() {
    let mut h = connected("bob", &["message-tags", "echo-message"]).await;

    let local = h.session.send_message("#rust", "hello world").await.unwrap();
    assert!(msgid::is_local(&local));
    {
        let store = h.session.store();
        let copy = store.get_message("#rust", &local).unwrap();
        assert_eq!(copy.send_state, Some(SendState::Sending));
    }
    h.server.expect("PRIVMSG #rust :hello world").await;

    h.server
        .send("@msgid=srv-1 :bob!u@h PRIVMSG #rust :hello world")
        .await;
    assert!(h.session.pump().await.unwrap());
    {
        let store = h.session.store();
        assert_eq!(store.len("#rust"), 1);
        assert!(store.get_message("#rust", &local).is_none());
        let confirmed = store.get_message("#rust", "srv-1").unwrap();
        assert!(confirmed.send_state.is_none());
    }
    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::MessageConfirmed { msgid, .. } if msgid == "srv-1")));
}

#[tokio::test]
async fn send_without_echo_is_marked_sent() {
    let mut h = connected("bob", &["message-tags"]).await;
    let local = h.session.send_message("carol", "psst").await.unwrap();
    h.server.expect("MONITOR + carol").await;
    h.server.expect("PRIVMSG carol psst").await;

    let store = h.session.store();
    assert_eq!(
        store.get_message("carol", &local).unwrap().send_state,
        Some(SendState::Sent)
    );
    drop(store);
    assert_eq!(h.session.monitored_nicks(), vec!["carol"]);
}

#[tokio::test]
async fn mutations_apply_locally_without_echo() {
    let mut h = connected("bob", &["message-tags"]).await;
    h.server
        .send("@msgid=m1 :carol!u@h PRIVMSG #rust :helo")
        .await;
    h.session.pump().await.unwrap();

    h.session.react("#rust", "m1", "👍").await.unwrap();
    let line = h.server.recv().await;
    assert!(line.starts_with('@') && line.ends_with("TAGMSG #rust"), "got {line}");
    assert!(line.contains("+draft/react=👍") && line.contains("+draft/reply=m1"));

    h.session.edit_message("#rust", "m1", "hello").await.unwrap();
    let line = h.server.recv().await;
    assert!(line.starts_with("@+draft/edit=m1 ") && line.ends_with("PRIVMSG #rust hello"));

    {
        let store = h.session.store();
        let msg = store.get_message("#rust", "m1").unwrap();
        assert_eq!(msg.reaction_count("👍"), 1);
        assert!(msg.reactions["👍"].contains("bob"));
        assert_eq!(msg.text, "hello");
        assert!(msg.is_edited);
    }

    h.session.delete_message("#rust", "m1").await.unwrap();
    h.server.expect("@+draft/delete=m1 TAGMSG #rust").await;
    assert!(h.session.store().get_message("#rust", "m1").unwrap().is_redacted);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(e, Event::ReactionsChanged { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::MessageEdited { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::MessageRedacted { .. })));
}

#[tokio::test]
async fn join_loads_history_and_pages_back() {
    let mut h = connected("bob", &["message-tags", "batch", "draft/chathistory"]).await;

    h.session.join("#rust").await.unwrap();
    h.server.expect("JOIN #rust").await;
    h.server.send(":bob!u@h JOIN #rust").await;
    h.session.pump().await.unwrap();
    h.server.expect("CHATHISTORY LATEST #rust * 50").await;

    for line in [
        ":srv BATCH +h1 chathistory #rust",
        "@batch=h1;msgid=m1;time=2026-03-01T10:00:00.000Z :carol!u@h PRIVMSG #rust :first",
        "@batch=h1;msgid=m2;time=2026-03-01T10:01:00.000Z :carol!u@h PRIVMSG #rust :second",
        ":srv BATCH -h1",
        "",
    ] {
        h.server.send(line).await;
        assert!(h.session.pump().await.unwrap());
    }
    {
        let store = h.session.store();
        let texts: Vec<&str> = store
            .get_messages("#rust")
            .into_iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }
    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::HistoryLoaded { count: 2, direction: HistoryDirection::Forward, .. }
    )));
    assert!(h.session.joined_channels().contains(&"#rust".to_string()));

    h.session.load_older("#rust").await.unwrap();
    h.server.expect("CHATHISTORY BEFORE #rust msgid=m1 50").await;
}

#[tokio::test]
async fn close_quits_and_is_terminal() {
    let mut h = connected("bob", &["message-tags"]).await;
    h.session.close().await;
    h.server.expect("QUIT Leaving").await;
    assert!(h.session.is_closed());
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert!(matches!(
        h.session.connect(Credentials::guest("bob")).await,
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        h.session.send_message("#rust", "late").await,
        Err(SessionError::Transport(_))
    ));
    assert!(h.host.errors.lock().is_empty());
}

#[tokio::test]
async fn close_during_connect_is_terminal() {
    init_tracing();
    let (connector, mut servers) = DuplexConnector::new();
    let host = Arc::new(FakeHost::default());
    let (session, _events) = ConnectionSession::new(
        SessionConfig::default(),
        Arc::new(connector),
        host.clone(),
        SessionServices::default(),
    );
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(Credentials::guest("alice")).await })
    };
    let mut server = servers.recv().await.unwrap();
    server.expect("CAP LS 302").await;
    server.recv().await;
    server.recv().await;

    let closing = {
        let session = session.clone();
        tokio::spawn(async move { session.close().await })
    };
    while !session.is_closed() {
        tokio::task::yield_now().await;
    }

    server.send(":srv CAP * LS :message-tags").await;
    let req = server.recv().await;
    assert!(req.starts_with("CAP REQ"), "got {req}");
    server.send(":srv CAP * ACK :message-tags").await;
    server.expect("CAP END").await;
    server.send(":srv 001 alice :Welcome to freeq").await;
    server.expect("QUIT Leaving").await;

    assert!(matches!(
        connecting.await.unwrap(),
        Err(SessionError::Closed)
    ));
    closing.await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(FakeHost::count(&host.welcomes), 0);
    assert!(host.errors.lock().is_empty());
}

#[tokio::test]
async fn connect_saved_requires_credentials() {
    let (connector, _servers) = DuplexConnector::new();
    let (session, _events) = ConnectionSession::new(
        SessionConfig::default(),
        Arc::new(connector),
        Arc::new(FakeHost::default()),
        SessionServices::default(),
    );
    assert!(matches!(
        session.connect_saved().await,
        Err(SessionError::NoCredentials)
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

struct Defaults;

#[async_trait]
impl ServerConfigSource for Defaults {
    async fn fetch(&self, _server_url: &str) -> Result<ServerConfig, ExternalServiceError> {
        Ok(ServerConfig {
            default_channels: vec!["#freeq".into(), "#help".into()],
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn server_defaults_are_joined_when_nothing_is() {
    init_tracing();
    let (connector, mut servers) = DuplexConnector::new();
    let services = SessionServices {
        server_config: Some(Arc::new(Defaults)),
        ..Default::default()
    };
    let (session, _events) = ConnectionSession::new(
        SessionConfig::default(),
        Arc::new(connector),
        Arc::new(FakeHost::default()),
        services,
    );
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(Credentials::guest("dana")).await })
    };
    let mut server = servers.recv().await.unwrap();
    server.handshake("dana", &[]).await;
    connecting.await.unwrap().unwrap();
    server.expect("JOIN #freeq,#help").await;
    assert_eq!(
        session.server_config().unwrap().default_channels,
        vec!["#freeq", "#help"]
    );
}
