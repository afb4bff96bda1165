#![forbid(unsafe_code)]

//! Protocol-agnostic websocket connector.
//!
//! A [`WsConnector`] owns exactly one logical connection and loops through
//! `Disconnected → Connecting → Subscribed → Disconnected` forever. Provider
//! specifics (URL, handshake frames, payload extraction, keepalive) live in a
//! [`WsProtocol`] implementation.

use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use subathon_domain::SourceId;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::{Backoff, BackoffConfig};
use crate::{
	ConnectionState, Connector, ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, ConnectorIdentity,
	RawBody, RawPayload, new_session_id, status, status_error,
};

pub type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of decoding one text frame.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
	/// Text frames to send back (handshake, pong).
	pub replies: Vec<String>,

	pub payloads: Vec<RawBody>,

	/// The subscribe handshake completed with this frame.
	pub subscribed: bool,

	/// Drop the connection and reconnect.
	pub reconnect: Option<String>,
}

impl Decoded {
	pub fn ignore() -> Self {
		Self::default()
	}

	pub fn reply(frame: impl Into<String>) -> Self {
		Self {
			replies: vec![frame.into()],
			..Self::default()
		}
	}

	pub fn payload(body: RawBody) -> Self {
		Self {
			payloads: vec![body],
			..Self::default()
		}
	}

	pub fn subscribed() -> Self {
		Self {
			subscribed: true,
			..Self::default()
		}
	}

	pub fn reconnect(reason: impl Into<String>) -> Self {
		Self {
			reconnect: Some(reason.into()),
			..Self::default()
		}
	}
}

/// Frame-level decode failures. Never fatal to the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed json frame: {0}")]
	Json(#[from] serde_json::Error),
	#[error("unexpected frame: {0}")]
	Unexpected(String),
}

/// Client-initiated keepalive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keepalive {
	None,
	/// Websocket ping frame at the given period.
	Ping(Duration),
	/// Protocol-level text frame at the given period.
	Text(Duration, String),
}

impl Keepalive {
	fn period(&self) -> Option<Duration> {
		match self {
			Keepalive::None => None,
			Keepalive::Ping(d) | Keepalive::Text(d, _) => Some(*d),
		}
	}
}

/// Provider-specific half of a websocket connector.
#[async_trait::async_trait]
pub trait WsProtocol: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	/// Resolve the URL for a fresh connection and reset per-connection state.
	async fn prepare(&mut self) -> anyhow::Result<Url>;

	/// Decode one text frame.
	fn decode(&mut self, text: &str) -> Result<Decoded, DecodeError>;

	fn keepalive(&self) -> Keepalive {
		Keepalive::None
	}

	/// Drop the connection if nothing arrives for this long.
	fn idle_timeout(&self) -> Duration;
}

enum SessionEnd {
	Shutdown,
	Lost(String),
}

/// Websocket connector driving a [`WsProtocol`].
pub struct WsConnector<P: WsProtocol> {
	identity: ConnectorIdentity,
	protocol: P,
	backoff: BackoffConfig,
}

impl<P: WsProtocol> WsConnector<P> {
	pub fn new(identity: ConnectorIdentity, protocol: P, backoff: BackoffConfig) -> Self {
		Self {
			identity,
			protocol,
			backoff,
		}
	}
}

async fn connect_ws(url: &Url) -> anyhow::Result<WsStream> {
	let (ws, _resp) = timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
		.await
		.context("websocket connect timed out")?
		.context("websocket connect")?;
	Ok(ws)
}

/// First tick one period from now. Disabled keepalives get a dormant timer.
fn keepalive_interval(keepalive: &Keepalive) -> Interval {
	let period = keepalive
		.period()
		.unwrap_or(Duration::from_secs(3600))
		.max(Duration::from_millis(1));
	let mut tick = tokio::time::interval(period);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
	tick.reset();
	tick
}

fn is_shutdown(cmd: Option<ConnectorControl>) -> bool {
	match cmd {
		Some(ConnectorControl::Shutdown) | None => true,
	}
}

#[async_trait::async_trait]
impl<P: WsProtocol> Connector for WsConnector<P> {
	fn identity(&self) -> &ConnectorIdentity {
		&self.identity
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let WsConnector {
			identity,
			mut protocol,
			backoff,
		} = *self;
		let source = identity.source.clone();
		let mut backoff = Backoff::new(backoff);
		let mut first_attempt = true;

		'outer: loop {
			if !first_attempt {
				let delay = backoff.next_delay();
				metrics::counter!("subathon_connector_reconnects_total", "source" => source.to_string()).increment(1);
				let _ = events_tx.try_send(status(
					&source,
					ConnectionState::Disconnected,
					format!("reconnecting in {delay:?} (attempt={})", backoff.attempt()),
				));
				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						if is_shutdown(cmd) {
							break 'outer;
						}
					}
				}
			}
			first_attempt = false;

			let _ = events_tx.try_send(status(
				&source,
				ConnectionState::Connecting,
				format!("connecting {}", protocol.name()),
			));

			let url = match protocol.prepare().await {
				Ok(url) => url,
				Err(e) => {
					warn!(%source, error = %e, "connector prepare failed");
					let _ = events_tx.try_send(status_error(&source, "prepare failed", e));
					continue;
				}
			};

			let mut ws = match connect_ws(&url).await {
				Ok(ws) => ws,
				Err(e) => {
					warn!(%source, error = %e, "connect failed");
					let _ = events_tx.try_send(status_error(&source, "connect failed", e));
					continue;
				}
			};

			let session_id = new_session_id();
			debug!(%source, %session_id, host = url.host_str().unwrap_or(""), "websocket connected");

			match drive_session(
				&identity,
				&mut protocol,
				&mut ws,
				&session_id,
				&mut backoff,
				&mut control_rx,
				&events_tx,
			)
			.await
			{
				SessionEnd::Shutdown => {
					let _ = ws.close(None).await;
					break 'outer;
				}
				SessionEnd::Lost(reason) => {
					warn!(%source, %session_id, %reason, "connection lost");
					let _ = events_tx.try_send(status(&source, ConnectionState::Disconnected, reason));
				}
			}
		}

		info!(%source, "connector stopped");
		let _ = events_tx.try_send(status(&source, ConnectionState::Disconnected, "connector stopped"));
		Ok(())
	}
}

async fn drive_session<P: WsProtocol>(
	identity: &ConnectorIdentity,
	protocol: &mut P,
	ws: &mut WsStream,
	session_id: &str,
	backoff: &mut Backoff,
	control_rx: &mut ConnectorControlRx,
	events_tx: &ConnectorEventTx,
) -> SessionEnd {
	let source: &SourceId = &identity.source;
	let idle = protocol.idle_timeout();
	let mut keepalive = protocol.keepalive();
	let mut keepalive_tick = keepalive_interval(&keepalive);

	let mut last_activity = Instant::now();
	let mut subscribed = false;

	loop {
		let idle_deadline = last_activity + idle;

		tokio::select! {
			cmd = control_rx.recv() => {
				if is_shutdown(cmd) {
					return SessionEnd::Shutdown;
				}
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					return SessionEnd::Lost("websocket stream ended".to_string());
				};
				let msg = match msg {
					Ok(m) => m,
					Err(e) => return SessionEnd::Lost(format!("websocket read error: {e}")),
				};
				last_activity = Instant::now();

				match msg {
					Message::Text(t) => {
						let decoded = match protocol.decode(t.as_str()) {
							Ok(d) => d,
							Err(e) => {
								warn!(%source, error = %e, "skipping undecodable frame");
								metrics::counter!("subathon_connector_decode_errors_total", "source" => source.to_string()).increment(1);
								continue;
							}
						};

						for reply in decoded.replies {
							if let Err(e) = ws.send(Message::text(reply)).await {
								return SessionEnd::Lost(format!("websocket write error: {e}"));
							}
						}

						if decoded.subscribed && !subscribed {
							subscribed = true;
							backoff.reset();
							info!(%source, %session_id, "subscribed");
							let _ = events_tx.try_send(status(source, ConnectionState::Subscribed, format!("subscribed (session_id={session_id})")));
						}

						for body in decoded.payloads {
							if !subscribed {
								debug!(%source, "dropping payload received before subscribe handshake");
								continue;
							}
							let payload = RawPayload::new(identity, session_id, body);
							if events_tx.send(ConnectorEvent::Payload(Box::new(payload))).await.is_err() {
								return SessionEnd::Shutdown;
							}
						}

						if let Some(reason) = decoded.reconnect {
							return SessionEnd::Lost(reason);
						}
					}
					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Close(frame) => {
						return SessionEnd::Lost(format!("websocket closed: {frame:?}"));
					}
					_ => {}
				}
			}

			_ = keepalive_tick.tick(), if keepalive.period().is_some() => {
				let frame = match &keepalive {
					Keepalive::Ping(_) => Message::Ping(Vec::new().into()),
					Keepalive::Text(_, text) => Message::text(text.clone()),
					Keepalive::None => continue,
				};
				if let Err(e) = ws.send(frame).await {
					return SessionEnd::Lost(format!("keepalive write error: {e}"));
				}
			}

			_ = sleep_until(idle_deadline) => {
				return SessionEnd::Lost(format!("no frames for {idle:?}; watchdog triggered"));
			}
		}
	}
}
