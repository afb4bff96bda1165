#![forbid(unsafe_code)]

//! Tipeee donation feed over socket.io (engine.io v3 framing).

use std::time::Duration;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::ws::{DecodeError, Decoded, Keepalive, WsProtocol};
use crate::{RawBody, SecretString};

pub const DEFAULT_TIPEEE_URL: &str = "wss://sso-cf.tipeeestream.com/socket.io/";

#[derive(Debug, Clone)]
pub struct TipeeeConfig {
	pub url: String,
	pub api_key: SecretString,
	pub username: String,
	pub ping_interval: Duration,
	pub idle_timeout: Duration,
}

impl TipeeeConfig {
	pub fn new(api_key: SecretString, username: impl Into<String>) -> Self {
		Self {
			url: DEFAULT_TIPEEE_URL.to_string(),
			api_key,
			username: username.into(),
			ping_interval: Duration::from_secs(25),
			idle_timeout: Duration::from_secs(90),
		}
	}
}

pub struct TipeeeProtocol {
	cfg: TipeeeConfig,
	joined: bool,

	/// Last `pingInterval` announced by the server.
	ping_interval: Duration,
}

impl TipeeeProtocol {
	pub fn new(cfg: TipeeeConfig) -> Self {
		let ping_interval = cfg.ping_interval;
		Self {
			cfg,
			joined: false,
			ping_interval,
		}
	}

	fn join(&mut self) -> Decoded {
		if self.joined {
			return Decoded::ignore();
		}
		self.joined = true;
		let frame = json!(["join-room", {"room": self.cfg.api_key.expose(), "username": self.cfg.username}]);
		let mut out = Decoded::reply(format!("42{frame}"));
		out.subscribed = true;
		out
	}

	fn on_event(&self, packet: &str) -> Result<Decoded, DecodeError> {
		let args: Vec<Value> = serde_json::from_str(packet)?;
		let Some(name) = args.first().and_then(Value::as_str) else {
			return Err(DecodeError::Unexpected("socket.io event without a name".to_string()));
		};
		if name != "new-event" {
			return Ok(Decoded::ignore());
		}

		let event = args
			.get(1)
			.and_then(|v| v.get("event"))
			.ok_or_else(|| DecodeError::Unexpected("new-event without event object".to_string()))?;
		if event.get("type").and_then(Value::as_str) != Some("donation") {
			return Ok(Decoded::ignore());
		}

		let params = event.get("parameters").cloned().unwrap_or(Value::Null);
		Ok(Decoded::payload(RawBody::Activity(json!({
			"type": "donation",
			"amount": params.get("amount").cloned().unwrap_or(Value::Null),
			"currency": params.get("currency").cloned().unwrap_or(Value::Null),
			"username": params.get("username").cloned().unwrap_or(Value::Null),
		}))))
	}
}

#[async_trait::async_trait]
impl WsProtocol for TipeeeProtocol {
	fn name(&self) -> &'static str {
		"tipeee-socketio"
	}

	async fn prepare(&mut self) -> anyhow::Result<Url> {
		if self.cfg.api_key.is_blank() {
			return Err(anyhow!("tipeee api key is empty"));
		}
		self.joined = false;
		let mut url = Url::parse(&self.cfg.url).context("parse tipeee url")?;
		url.query_pairs_mut()
			.append_pair("EIO", "3")
			.append_pair("transport", "websocket")
			.append_pair("access_token", self.cfg.api_key.expose());
		Ok(url)
	}

	fn decode(&mut self, text: &str) -> Result<Decoded, DecodeError> {
		// engine.io packet type is the first byte; socket.io packet type the second.
		match text.as_bytes().first() {
			Some(b'0') => {
				let open: Value = serde_json::from_str(&text[1..])?;
				if let Some(ms) = open.get("pingInterval").and_then(Value::as_u64) {
					self.ping_interval = Duration::from_millis(ms.max(1_000));
				}
				debug!(ping_interval = ?self.ping_interval, "engine.io open");
				Ok(self.join())
			}
			Some(b'1') => Ok(Decoded::reconnect("engine.io close")),
			Some(b'2') => Ok(Decoded::reply("3")),
			Some(b'3') => Ok(Decoded::ignore()),
			Some(b'4') => match text.as_bytes().get(1) {
				Some(b'0') => Ok(self.join()),
				Some(b'1') => Ok(Decoded::reconnect("socket.io namespace disconnected")),
				Some(b'2') => self.on_event(&text[2..]),
				Some(b'4') => Ok(Decoded::reconnect(format!("socket.io error: {}", &text[2..]))),
				_ => Ok(Decoded::ignore()),
			},
			_ => Err(DecodeError::Unexpected(format!("unknown engine.io packet: {text}"))),
		}
	}

	fn keepalive(&self) -> Keepalive {
		Keepalive::Text(self.ping_interval, "2".to_string())
	}

	fn idle_timeout(&self) -> Duration {
		self.cfg.idle_timeout
	}
}
