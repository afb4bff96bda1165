#![forbid(unsafe_code)]

//! Kick chat over the Pusher websocket protocol.

use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use super::client::KickClient;
use crate::RawBody;
use crate::ws::{DecodeError, Decoded, Keepalive, WsProtocol};

const CHAT_MESSAGE_EVENT: &str = "App\\Events\\ChatMessageEvent";

#[derive(Debug, Clone)]
pub struct KickChatConfig {
	pub app_key: String,
	pub cluster: String,

	/// Chatroom to join. Resolved from `channel_slug` when absent.
	pub chatroom_id: Option<u64>,
	pub channel_slug: Option<String>,

	/// Full websocket URL, overriding the one derived from key and cluster.
	pub endpoint: Option<Url>,

	pub ping_interval: Duration,
	pub idle_timeout: Duration,
}

impl KickChatConfig {
	pub fn new(app_key: impl Into<String>, cluster: impl Into<String>) -> Self {
		Self {
			app_key: app_key.into(),
			cluster: cluster.into(),
			chatroom_id: None,
			channel_slug: None,
			endpoint: None,
			ping_interval: Duration::from_secs(60),
			idle_timeout: Duration::from_secs(150),
		}
	}

	fn pusher_url(&self) -> anyhow::Result<Url> {
		if let Some(endpoint) = &self.endpoint {
			return Ok(endpoint.clone());
		}
		if self.app_key.trim().is_empty() || self.cluster.trim().is_empty() {
			return Err(anyhow!("kick pusher app key and cluster are required"));
		}
		let raw = format!(
			"wss://ws-{}.pusher.com/app/{}?protocol=7&client=js&version=8.4.0&flash=false",
			self.cluster.trim(),
			self.app_key.trim()
		);
		Url::parse(&raw).context("build kick pusher url")
	}
}

pub struct KickChatProtocol {
	cfg: KickChatConfig,
	client: KickClient,
	chatroom_id: Option<u64>,
}

impl KickChatProtocol {
	pub fn new(cfg: KickChatConfig) -> Self {
		Self::with_client(cfg, KickClient::default())
	}

	pub fn with_client(cfg: KickChatConfig, client: KickClient) -> Self {
		let chatroom_id = cfg.chatroom_id;
		Self {
			cfg,
			client,
			chatroom_id,
		}
	}

	fn channel(&self) -> Option<String> {
		self.chatroom_id.map(|id| format!("chatrooms.{id}.v2"))
	}
}

#[derive(Debug, Deserialize)]
struct PusherFrame {
	event: String,
	#[serde(default)]
	data: Value,
	#[serde(default)]
	channel: Option<String>,
}

/// Pusher double-encodes `data` as a JSON string most of the time.
fn unwrap_data(data: Value) -> Value {
	match data {
		Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
		other => other,
	}
}

#[async_trait::async_trait]
impl WsProtocol for KickChatProtocol {
	fn name(&self) -> &'static str {
		"kick-pusher"
	}

	async fn prepare(&mut self) -> anyhow::Result<Url> {
		if self.chatroom_id.is_none() {
			let slug = self
				.cfg
				.channel_slug
				.as_deref()
				.ok_or_else(|| anyhow!("kick chat needs a chatroom id or a channel slug"))?;
			let id = self
				.client
				.resolve_chatroom_id(slug)
				.await?
				.ok_or_else(|| anyhow!("kick channel not found: {slug}"))?;
			info!(%slug, chatroom_id = id, "resolved kick chatroom");
			self.chatroom_id = Some(id);
		}
		self.cfg.pusher_url()
	}

	fn decode(&mut self, text: &str) -> Result<Decoded, DecodeError> {
		let frame: PusherFrame = serde_json::from_str(text)?;

		match frame.event.as_str() {
			"pusher:connection_established" => {
				let channel = self
					.channel()
					.ok_or_else(|| DecodeError::Unexpected("connection established before chatroom is known".to_string()))?;
				debug!(%channel, "pusher connected; subscribing");
				Ok(Decoded::reply(
					json!({"event": "pusher:subscribe", "data": {"auth": "", "channel": channel}}).to_string(),
				))
			}
			"pusher_internal:subscription_succeeded" => {
				if frame.channel.is_some() && frame.channel == self.channel() {
					Ok(Decoded::subscribed())
				} else {
					Ok(Decoded::ignore())
				}
			}
			"pusher:ping" => Ok(Decoded::reply(json!({"event": "pusher:pong", "data": {}}).to_string())),
			"pusher:error" => {
				let data = unwrap_data(frame.data);
				let code = data.get("code").and_then(Value::as_i64).unwrap_or_default();
				let message = data.get("message").and_then(Value::as_str).unwrap_or("unknown");
				Ok(Decoded::reconnect(format!("pusher error {code}: {message}")))
			}
			CHAT_MESSAGE_EVENT => {
				let data = unwrap_data(frame.data);
				let Some(content) = data.get("content").and_then(Value::as_str) else {
					return Err(DecodeError::Unexpected("chat message without content".to_string()));
				};
				let sender = data
					.get("sender")
					.and_then(|s| s.get("username"))
					.and_then(Value::as_str)
					.map(str::to_string);
				Ok(Decoded::payload(RawBody::Chat {
					text: content.to_string(),
					sender,
				}))
			}
			_ => Ok(Decoded::ignore()),
		}
	}

	fn keepalive(&self) -> Keepalive {
		Keepalive::Text(
			self.cfg.ping_interval,
			json!({"event": "pusher:ping", "data": {}}).to_string(),
		)
	}

	fn idle_timeout(&self) -> Duration {
		self.cfg.idle_timeout
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn protocol() -> KickChatProtocol {
		let mut cfg = KickChatConfig::new("appkey", "us2");
		cfg.chatroom_id = Some(42);
		KickChatProtocol::new(cfg)
	}

	#[test]
	fn derives_pusher_url_from_key_and_cluster() {
		let url = KickChatConfig::new("abc", "us2").pusher_url().unwrap();
		assert_eq!(url.host_str(), Some("ws-us2.pusher.com"));
		assert_eq!(url.path(), "/app/abc");
		assert!(KickChatConfig::new("", "us2").pusher_url().is_err());
	}

	#[test]
	fn subscribes_to_chatroom_on_connect() {
		let mut p = protocol();
		let out = p
			.decode(r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.2\",\"activity_timeout\":120}"}"#)
			.unwrap();
		let reply: Value = serde_json::from_str(&out.replies[0]).unwrap();
		assert_eq!(reply["event"], "pusher:subscribe");
		assert_eq!(reply["data"]["channel"], "chatrooms.42.v2");
		assert!(!out.subscribed);
	}

	#[test]
	fn subscription_succeeded_only_for_own_channel() {
		let mut p = protocol();
		let ok = p
			.decode(r#"{"event":"pusher_internal:subscription_succeeded","data":"{}","channel":"chatrooms.42.v2"}"#)
			.unwrap();
		assert!(ok.subscribed);

		let other = p
			.decode(r#"{"event":"pusher_internal:subscription_succeeded","data":"{}","channel":"chatrooms.7.v2"}"#)
			.unwrap();
		assert!(!other.subscribed);
	}

	#[test]
	fn answers_ping_with_pong() {
		let mut p = protocol();
		let out = p.decode(r#"{"event":"pusher:ping","data":{}}"#).unwrap();
		assert_eq!(out.replies.len(), 1);
		assert!(out.replies[0].contains("pusher:pong"));
	}

	#[test]
	fn chat_message_yields_chat_body() {
		let mut p = protocol();
		let frame = json!({
			"event": CHAT_MESSAGE_EVENT,
			"channel": "chatrooms.42.v2",
			"data": json!({"id": "m1", "content": "alice gifted 500 KICKs", "sender": {"username": "KickBot"}}).to_string(),
		});
		let out = p.decode(&frame.to_string()).unwrap();
		assert_eq!(
			out.payloads,
			vec![RawBody::Chat {
				text: "alice gifted 500 KICKs".to_string(),
				sender: Some("KickBot".to_string()),
			}]
		);
	}

	#[test]
	fn pusher_error_forces_reconnect() {
		let mut p = protocol();
		let out = p
			.decode(r#"{"event":"pusher:error","data":{"code":4201,"message":"Pong reply not received"}}"#)
			.unwrap();
		assert!(out.reconnect.unwrap().contains("4201"));
	}

	#[test]
	fn malformed_frames_are_decode_errors() {
		let mut p = protocol();
		assert!(p.decode("not json").is_err());
		assert!(matches!(
			p.decode(&json!({"event": CHAT_MESSAGE_EVENT, "data": "{}"}).to_string()),
			Err(DecodeError::Unexpected(_))
		));
	}

	#[tokio::test]
	async fn prepare_without_id_or_slug_fails() {
		let mut p = KickChatProtocol::new(KickChatConfig::new("k", "us2"));
		assert!(p.prepare().await.is_err());
	}
}
