//! Abstract duplex line channel.
//!
//! The engine never frames bytes or speaks TLS itself: a host hands it a
//! [`TransportLink`] (a send half and a receive half of CRLF-delimited lines)
//! through a [`Connector`]. [`TransportLink::from_io`] adapts any tokio
//! byte stream, and [`TcpConnector`] covers plain TCP.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::TransportError;
use crate::irc::Message;

/// Outbound half of a connection.
#[async_trait]
pub trait LineSink: Send {
    /// Write one line. The implementation appends the terminator.
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait LineStream: Send {
    /// Next line without its terminator; `Ok(None)` once the peer closed.
    async fn recv_line(&mut self) -> Result<Option<String>, TransportError>;
}

/// Opens fresh transport instances (initial connect and reconnects).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportLink, TransportError>;
}

/// Both halves of one transport instance.
pub struct TransportLink {
    pub sink: Box<dyn LineSink>,
    pub stream: Box<dyn LineStream>,
}

impl TransportLink {
    pub fn new(sink: Box<dyn LineSink>, stream: Box<dyn LineStream>) -> Self {
        Self { sink, stream }
    }

    /// Split a byte stream into CRLF line halves.
    pub fn from_io<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            sink: Box::new(IoSink(writer)),
            stream: Box::new(IoStream {
                reader: BufReader::new(reader),
                buf: Vec::new(),
            }),
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportLink")
    }
}

struct IoSink<W>(W);

#[async_trait]
impl<W> LineSink for IoSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.0.write_all(format!("{line}\r\n").as_bytes()).await?;
        self.0.flush().await?;
        Ok(())
    }
}

struct IoStream<R> {
    reader: R,
    buf: Vec<u8>,
}

#[async_trait]
impl<R> LineStream for IoStream<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn recv_line(&mut self) -> Result<Option<String>, TransportError> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        // Invalid UTF-8 is replaced rather than failing the whole connection.
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Plain TCP connector (`host:port`). TLS is left to the host.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        tracing::debug!("Resolving {}...", self.addr);
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;
        tracing::debug!("TCP connected to {}", self.addr);
        Ok(TransportLink::from_io(tcp))
    }
}

/// Borrowed view of a link used while a handshake owns the connection.
///
/// Answers `PING`, drops unparsable lines and keeps everything the handshake
/// does not consume in `backlog` for the dispatcher.
pub(crate) struct Wire<'a> {
    sink: &'a mut (dyn LineSink + 'static),
    stream: &'a mut (dyn LineStream + 'static),
    pub backlog: Vec<Message>,
}

impl<'a> Wire<'a> {
    pub fn new(
        sink: &'a mut (dyn LineSink + 'static),
        stream: &'a mut (dyn LineStream + 'static),
    ) -> Self {
        Self {
            sink,
            stream,
            backlog: Vec::new(),
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let line = msg.to_string();
        tracing::debug!(line = %line, "send");
        self.sink.send_line(&line).await
    }

    /// Next parsed message, or `None` once the peer closed.
    pub async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let Some(line) = self.stream.recv_line().await? else {
                return Ok(None);
            };
            let Some(msg) = Message::parse(&line) else {
                tracing::debug!(line = %line, "dropping malformed line");
                continue;
            };
            if msg.command == "PING" {
                let token = msg.param(0).unwrap_or("").to_string();
                self.send(&Message::new("PONG", &[&token])).await?;
                continue;
            }
            return Ok(Some(msg));
        }
    }

    pub fn defer(&mut self, msg: Message) {
        self.backlog.push(msg);
    }
}
