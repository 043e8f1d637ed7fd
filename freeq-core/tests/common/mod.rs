//! Scripted in-memory server and host fakes shared by the session tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use freeq_core::{
    BearerToken, Connector, ExternalServiceError, MonitorChange, SessionHost, TokenIssuer,
    TransportError, TransportLink,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

const STEP: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("freeq_core=debug")
        .with_test_writer()
        .try_init();
}

/// Server end of an in-memory connection.
pub struct FakeServer {
    io: BufReader<DuplexStream>,
}

/// A client link plus the server end scripting it.
pub fn pair() -> (TransportLink, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (
        TransportLink::from_io(client),
        FakeServer {
            io: BufReader::new(server),
        },
    )
}

impl FakeServer {
    pub async fn send(&mut self, line: &str) {
        self.io
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to client");
    }

    /// Next line from the client.
    pub async fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(STEP, self.io.read_line(&mut line))
            .await
            .expect("timed out waiting for client line")
            .expect("read from client");
        assert!(n > 0, "client closed the connection");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Next line, asserting it equals `expected`.
    pub async fn expect(&mut self, expected: &str) {
        let line = self.recv().await;
        assert_eq!(line, expected);
    }

    /// Answer the client's side of CAP, optional SASL and registration.
    /// Everything requested is acknowledged. Returns the acknowledged caps.
    pub async fn handshake(&mut self, nick: &str, offered: &[&str]) -> Vec<String> {
        self.expect("CAP LS 302").await;
        let nick_line = self.recv().await;
        assert!(nick_line.starts_with("NICK "), "got {nick_line}");
        let user_line = self.recv().await;
        assert!(user_line.starts_with("USER "), "got {user_line}");
        self.send(&format!(":srv CAP * LS :{}", offered.join(" ")))
            .await;

        let line = self.recv().await;
        let acked: Vec<String> = match line.strip_prefix("CAP REQ ") {
            Some(list) => list
                .trim_start_matches(':')
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            None => {
                assert_eq!(line, "CAP END");
                Vec::new()
            }
        };
        if !acked.is_empty() {
            self.send(&format!(":srv CAP * ACK :{}", acked.join(" ")))
                .await;
            if acked.iter().any(|c| c == "sasl") {
                self.expect("AUTHENTICATE PLAIN").await;
                self.send("AUTHENTICATE +").await;
                let payload = self.recv().await;
                assert!(payload.starts_with("AUTHENTICATE "));
                self.send(&format!(
                    ":srv 900 {nick} {nick}!u@h {nick} :You are now logged in as {nick}"
                ))
                .await;
                self.send(&format!(":srv 903 {nick} :SASL authentication successful"))
                    .await;
            }
            self.expect("CAP END").await;
        }
        self.send(&format!(":srv 001 {nick} :Welcome to freeq"))
            .await;
        acked
    }
}

/// Hands each new link's server end to the test through a channel.
pub struct DuplexConnector {
    servers: mpsc::UnboundedSender<FakeServer>,
}

impl DuplexConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { servers: tx }, rx)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let (link, server) = pair();
        self.servers
            .send(server)
            .map_err(|_| TransportError::Connect {
                addr: "duplex".into(),
                reason: "test dropped the receiver".into(),
            })?;
        Ok(link)
    }
}

#[derive(Default)]
pub struct FakeHost {
    pub connections: AtomicUsize,
    pub welcomes: AtomicUsize,
    pub cleared: AtomicUsize,
    pub voice_restores: AtomicUsize,
    pub errors: parking_lot::Mutex<Vec<String>>,
    pub monitor: parking_lot::Mutex<Vec<MonitorChange>>,
    pub tokens: parking_lot::Mutex<Vec<BearerToken>>,
}

impl FakeHost {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHost for FakeHost {
    fn on_connection_created(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn on_error_cleared(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn on_welcome(&self, _nick: &str) {
        self.welcomes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_monitor_changed(&self, change: &MonitorChange) {
        self.monitor.lock().push(change.clone());
    }

    fn on_token_refreshed(&self, token: &BearerToken) {
        self.tokens.lock().push(token.clone());
    }

    async fn restore_voice(&self) -> anyhow::Result<()> {
        self.voice_restores.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTokenIssuer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenIssuer for FakeTokenIssuer {
    async fn fetch_token(
        &self,
        _server_url: &str,
        account: &str,
        _password: &str,
    ) -> Result<BearerToken, ExternalServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BearerToken {
            token: format!("{account}-{n}"),
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        })
    }
}
