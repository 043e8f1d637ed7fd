//! freeq-core: client protocol engine for freeq IRC clients.
//!
//! Speaks IRC with IRCv3 extensions over any line transport:
//! - Wire codec with message tags (`irc`)
//! - CAP 302 negotiation and SASL PLAIN (`cap`, `sasl`)
//! - Connection lifecycle with reconnect recovery (`session`, `recovery`)
//! - Per-conversation message store with history merge, edits, reactions
//!   and pins (`store`)
//!
//! UI concerns stay in the host: the engine reports through [`SessionHost`]
//! callbacks and an [`Event`] stream.

pub mod cap;
pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod irc;
pub mod msgid;
pub mod presence;
pub mod recovery;
pub mod sasl;
pub mod session;
pub mod store;
pub mod transport;

mod dispatch;
mod token;

pub use config::{Credentials, ReconnectConfig, SessionConfig};
pub use error::{
    AuthError, ExternalServiceError, HandshakeError, HandshakePhase, RecoveryError, SessionError,
    TransportError,
};
pub use event::Event;
pub use host::{
    BearerToken, CredentialStore, MonitorChange, ServerConfig, ServerConfigSource, SessionHost,
    TokenIssuer,
};
pub use irc::Message;
pub use recovery::RecoveryOutcome;
pub use session::{ConnectionSession, ConnectionState, SessionServices};
pub use store::{ChannelMessageStore, ChatMessage, HistoryDirection, MessageKind, SendState};
pub use transport::{Connector, LineSink, LineStream, TcpConnector, TransportLink};
