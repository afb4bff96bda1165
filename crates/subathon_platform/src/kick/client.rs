#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use serde::Deserialize;

/// Minimal client for Kick's public channel endpoints.
#[derive(Debug, Clone)]
pub struct KickClient {
	base_url: String,
	client: reqwest::Client,
}

impl Default for KickClient {
	fn default() -> Self {
		Self::new("https://kick.com")
	}
}

impl KickClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			client: reqwest::Client::new(),
		}
	}

	/// Look up the chatroom id behind a channel slug. `Ok(None)` if the
	/// channel does not exist.
	pub async fn resolve_chatroom_id(&self, slug: &str) -> anyhow::Result<Option<u64>> {
		let slug = slug.trim();
		if slug.is_empty() {
			return Err(anyhow!("kick channel slug is empty"));
		}

		let url = format!(
			"{}/api/v2/channels/{}/chatroom",
			self.base_url.trim_end_matches('/'),
			urlencoding::encode(slug)
		);
		let resp = self
			.client
			.get(url)
			.header("Accept", "application/json")
			.header("User-Agent", "subathon-server/0.1")
			.send()
			.await
			.context("kick get chatroom")?;

		if resp.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !resp.status().is_success() {
			return Err(anyhow!("kick get chatroom failed: status={}", resp.status()));
		}

		let body: KickChatroomResponse = resp.json().await.context("parse kick chatroom response")?;
		Ok(Some(body.id))
	}
}

#[derive(Debug, Deserialize)]
struct KickChatroomResponse {
	id: u64,
}
