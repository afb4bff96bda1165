#![forbid(unsafe_code)]

//! StreamElements astro realtime gateway (`channel.activities`).

use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::ws::{DecodeError, Decoded, Keepalive, WsProtocol};
use crate::{RawBody, SecretString, new_nonce};

pub const DEFAULT_ASTRO_URL: &str = "wss://astro.streamelements.com";
pub const ACTIVITIES_TOPIC: &str = "channel.activities";

#[derive(Debug, Clone)]
pub struct StreamElementsConfig {
	pub url: String,
	pub token: SecretString,
	pub topic: String,
	pub ping_interval: Duration,
	pub idle_timeout: Duration,
}

impl StreamElementsConfig {
	pub fn new(token: SecretString) -> Self {
		Self {
			url: DEFAULT_ASTRO_URL.to_string(),
			token,
			topic: ACTIVITIES_TOPIC.to_string(),
			ping_interval: Duration::from_secs(30),
			idle_timeout: Duration::from_secs(90),
		}
	}
}

pub struct StreamElementsProtocol {
	cfg: StreamElementsConfig,

	/// Nonce of the in-flight subscribe request on the current connection.
	pending_nonce: Option<String>,
}

impl StreamElementsProtocol {
	pub fn new(cfg: StreamElementsConfig) -> Self {
		Self {
			cfg,
			pending_nonce: None,
		}
	}

	fn subscribe_frame(&mut self) -> String {
		let nonce = new_nonce();
		self.pending_nonce = Some(nonce.clone());
		json!({
			"type": "subscribe",
			"nonce": nonce,
			"data": {
				"topic": self.cfg.topic,
				"token": self.cfg.token.expose(),
				"token_type": "jwt",
			},
		})
		.to_string()
	}
}

#[derive(Debug, Deserialize)]
struct AstroFrame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	nonce: Option<String>,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	data: Value,
}

#[async_trait::async_trait]
impl WsProtocol for StreamElementsProtocol {
	fn name(&self) -> &'static str {
		"streamelements-astro"
	}

	async fn prepare(&mut self) -> anyhow::Result<Url> {
		if self.cfg.token.is_blank() {
			return Err(anyhow!("streamelements token is empty"));
		}
		self.pending_nonce = None;
		Url::parse(&self.cfg.url).context("parse streamelements url")
	}

	fn decode(&mut self, text: &str) -> Result<Decoded, DecodeError> {
		let frame: AstroFrame = serde_json::from_str(text)?;

		match frame.kind.as_str() {
			"welcome" => {
				debug!(topic = %self.cfg.topic, "astro welcome; subscribing");
				Ok(Decoded::reply(self.subscribe_frame()))
			}
			"response" => {
				let error = frame
					.error
					.or_else(|| frame.data.get("error").and_then(Value::as_str).map(str::to_string));
				if let Some(error) = error {
					return Ok(Decoded::reconnect(format!("subscribe rejected: {error}")));
				}
				if frame.nonce.is_some() && frame.nonce == self.pending_nonce {
					self.pending_nonce = None;
					Ok(Decoded::subscribed())
				} else {
					Ok(Decoded::ignore())
				}
			}
			"message" => match frame.data {
				Value::Object(_) => Ok(Decoded::payload(RawBody::Activity(frame.data))),
				_ => Err(DecodeError::Unexpected("message frame without activity data".to_string())),
			},
			"reconnect" => Ok(Decoded::reconnect("server requested reconnect")),
			other => {
				warn!(kind = %other, "ignoring unknown astro frame");
				Ok(Decoded::ignore())
			}
		}
	}

	fn keepalive(&self) -> Keepalive {
		Keepalive::Ping(self.cfg.ping_interval)
	}

	fn idle_timeout(&self) -> Duration {
		self.cfg.idle_timeout
	}
}
