#![forbid(unsafe_code)]

pub mod backoff;
pub mod kick;
pub mod normalize;
pub mod streamelements;
pub mod tipeee;
pub mod ws;

use std::fmt;
use std::time::SystemTime;

use subathon_domain::{Platform, SourceId, StreamerId};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use backoff::{Backoff, BackoffConfig};
pub use normalize::{normalize, parse_kick_gift_chat};
pub use ws::{Decoded, DecodeError, Keepalive, WsConnector, WsProtocol};

/// Server → connector control message.
#[derive(Debug)]
pub enum ConnectorControl {
	/// Request a shutdown. Pending payloads are not drained.
	Shutdown,
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Who owns a connector and where its payloads come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorIdentity {
	pub source: SourceId,
	pub platform: Platform,
	pub streamer: StreamerId,
}

impl ConnectorIdentity {
	pub fn new(source: SourceId, platform: Platform, streamer: StreamerId) -> Self {
		Self {
			source,
			platform,
			streamer,
		}
	}
}

/// Connector → server event message.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
	/// Raw provider payload, not yet normalized.
	Payload(Box<RawPayload>),

	/// Connector status update.
	Status(ConnectorStatus),
}

/// Provider payload as received, tagged with its origin.
#[derive(Debug, Clone)]
pub struct RawPayload {
	pub source: SourceId,
	pub platform: Platform,
	pub streamer: StreamerId,

	/// Receipt timestamp (not for ordering).
	pub received_at: SystemTime,

	/// Connection the payload arrived on.
	pub session_id: String,

	pub body: RawBody,
}

impl RawPayload {
	pub fn new(identity: &ConnectorIdentity, session_id: impl Into<String>, body: RawBody) -> Self {
		Self {
			source: identity.source.clone(),
			platform: identity.platform,
			streamer: identity.streamer.clone(),
			received_at: SystemTime::now(),
			session_id: session_id.into(),
			body,
		}
	}
}

/// Payload shapes emitted by connectors.
#[derive(Debug, Clone, PartialEq)]
pub enum RawBody {
	/// Activity object (`{"type": ..., "data": {...}}`).
	Activity(serde_json::Value),

	/// Plain chat line.
	Chat { text: String, sender: Option<String> },
}

impl RawBody {
	/// JSON rendering used by the raw event log.
	pub fn to_log_json(&self) -> serde_json::Value {
		match self {
			RawBody::Activity(v) => v.clone(),
			RawBody::Chat { text, sender } => serde_json::json!({
				"type": "chat",
				"sender": sender,
				"content": text,
			}),
		}
	}
}

/// Connector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Subscribed,
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Subscribed => "subscribed",
		})
	}
}

/// Connector status event.
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
	pub source: SourceId,
	pub state: ConnectionState,
	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

/// Helper types for wiring connectors.
pub type ConnectorControlTx = mpsc::Sender<ConnectorControl>;
pub type ConnectorControlRx = mpsc::Receiver<ConnectorControl>;
pub type ConnectorEventTx = mpsc::Sender<ConnectorEvent>;
pub type ConnectorEventRx = mpsc::Receiver<ConnectorEvent>;

/// Trait representing a runnable provider connector.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
	/// Identity stamped onto every payload.
	fn identity(&self) -> &ConnectorIdentity;

	/// Run until shutdown. Transport failures are retried internally and
	/// never returned.
	async fn run(self: Box<Self>, control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()>;
}

/// Build a status event.
pub fn status(source: &SourceId, state: ConnectionState, detail: impl Into<String>) -> ConnectorEvent {
	ConnectorEvent::Status(ConnectorStatus {
		source: source.clone(),
		state,
		detail: detail.into(),
		last_error: None,
		time: SystemTime::now(),
	})
}

/// Build an error status event.
pub fn status_error(source: &SourceId, detail: impl Into<String>, err: impl fmt::Display) -> ConnectorEvent {
	ConnectorEvent::Status(ConnectorStatus {
		source: source.clone(),
		state: ConnectionState::Disconnected,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		time: SystemTime::now(),
	})
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Generate a per-request nonce for subscribe frames.
pub fn new_nonce() -> String {
	Uuid::new_v4().to_string()
}
