#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use subathon_domain::{RewardRates, StreamerId};
use subathon_platform::{BackoffConfig, SecretString};
use tracing::{info, warn};

use crate::server::accumulator::DEFAULT_TICK_PERSIST_EVERY;
use crate::server::broadcaster::DEFAULT_BROADCAST_CAPACITY;
use crate::server::correlation::{CorrelationConfig, DEFAULT_BUNDLE_RETENTION, DEFAULT_GIFT_WINDOW};
use crate::server::event_log::{DEFAULT_EVENT_LOG_QUEUE, EventLogConfig};

pub const DEFAULT_BIND: &str = "http://127.0.0.1:5000";
pub const DEFAULT_START_MINUTES: u64 = 60;
pub const DEFAULT_KICK_CLUSTER: &str = "us2";

/// `~/.subathon`.
pub fn default_data_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".subathon"))
}

/// Default config path: `~/.subathon/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_data_dir()?.join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let data_dir = default_data_dir()?;
	let mut cfg = ServerConfig::from_file(file_cfg, &data_dir)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub start_minutes: u64,
	pub correlation: CorrelationConfig,
	pub reconnect: BackoffConfig,
	pub event_log: EventLogConfig,
	pub streamers: Vec<StreamerSettings>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP control surface (`http://host:port`).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Timer snapshot file.
	pub state_path: PathBuf,
	pub tick_persist_every: u32,
	pub broadcast_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct StreamerSettings {
	pub id: StreamerId,
	pub rewards: Arc<RewardRates>,

	/// StreamElements JWT for the streamer's Twitch channel.
	pub streamelements_token: Option<SecretString>,
	/// StreamElements JWT for the streamer's Kick channel.
	pub streamelements_kick_token: Option<SecretString>,

	pub tipeee: Option<TipeeeSettings>,
	pub kick_chat: Option<KickChatSettings>,
}

#[derive(Debug, Clone)]
pub struct TipeeeSettings {
	pub api_key: SecretString,
	pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct KickChatSettings {
	pub app_key: Option<String>,
	pub cluster: Option<String>,
	pub chatroom_id: Option<u64>,
	pub channel_slug: Option<String>,
}

impl KickChatSettings {
	/// App key plus a chatroom id or slug.
	pub fn is_usable(&self) -> bool {
		self.app_key.is_some() && (self.chatroom_id.is_some() || self.channel_slug.is_some())
	}
}

impl StreamerSettings {
	fn empty(id: StreamerId) -> Self {
		Self {
			id,
			rewards: Arc::new(RewardRates::default()),
			streamelements_token: None,
			streamelements_kick_token: None,
			tipeee: None,
			kick_chat: None,
		}
	}

	pub fn is_primary(&self) -> bool {
		self.id == StreamerId::numbered(1)
	}

	/// The primary streamer is always active; others need a StreamElements
	/// token.
	pub fn is_active(&self) -> bool {
		self.is_primary() || self.streamelements_token.is_some()
	}
}

impl ServerConfig {
	pub fn active_streamers(&self) -> impl Iterator<Item = &StreamerSettings> {
		self.streamers.iter().filter(|s| s.is_active())
	}

	/// Reward rates served by `/rewards`, keyed by streamer.
	pub fn reward_table(&self) -> BTreeMap<StreamerId, Arc<RewardRates>> {
		self.active_streamers()
			.map(|s| (s.id.clone(), Arc::clone(&s.rewards)))
			.collect()
	}

	fn streamer_mut(&mut self, number: u32) -> &mut StreamerSettings {
		let id = StreamerId::numbered(number);
		let pos = match self.streamers.iter().position(|s| s.id == id) {
			Some(pos) => pos,
			None => {
				self.streamers.push(StreamerSettings::empty(id));
				self.streamers.len() - 1
			}
		};
		&mut self.streamers[pos]
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	timer: FileTimerSettings,

	#[serde(default)]
	correlation: FileCorrelationSettings,

	#[serde(default)]
	reconnect: FileReconnectSettings,

	#[serde(default)]
	event_log: FileEventLogSettings,

	#[serde(default)]
	streamers: Vec<FileStreamer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	state_path: Option<String>,
	tick_persist_every: Option<u32>,
	broadcast_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTimerSettings {
	start_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCorrelationSettings {
	gift_window_secs: Option<u64>,
	bundle_retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconnectSettings {
	min_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEventLogSettings {
	enabled: Option<bool>,
	path: Option<String>,
	database_url: Option<String>,
	queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileStreamer {
	id: String,

	#[serde(default)]
	rewards: RewardRates,

	streamelements_token: Option<SecretString>,
	streamelements_kick_token: Option<SecretString>,

	tipeee: Option<FileTipeee>,
	kick_chat: Option<FileKickChat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileTipeee {
	api_key: SecretString,
	username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickChat {
	app_key: Option<String>,
	cluster: Option<String>,
	chatroom_id: Option<u64>,
	channel_slug: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn non_blank_secret(v: Option<SecretString>) -> Option<SecretString> {
	v.filter(|s| !s.is_blank())
}

impl ServerConfig {
	fn from_file(file: FileConfig, data_dir: &Path) -> anyhow::Result<Self> {
		let mut streamers: Vec<StreamerSettings> = Vec::with_capacity(file.streamers.len().max(1));
		for s in file.streamers {
			let id = StreamerId::new(s.id.trim()).context("streamers[].id")?;
			if streamers.iter().any(|existing| existing.id == id) {
				return Err(anyhow!("duplicate streamer id {id}"));
			}
			let kick_chat = s.kick_chat.map(|k| KickChatSettings {
				app_key: non_blank(k.app_key),
				cluster: non_blank(k.cluster),
				chatroom_id: k.chatroom_id,
				channel_slug: non_blank(k.channel_slug),
			});
			streamers.push(StreamerSettings {
				id,
				rewards: Arc::new(s.rewards),
				streamelements_token: non_blank_secret(s.streamelements_token),
				streamelements_kick_token: non_blank_secret(s.streamelements_kick_token),
				tipeee: s
					.tipeee
					.filter(|t| !t.api_key.is_blank() && !t.username.trim().is_empty())
					.map(|t| TipeeeSettings {
						api_key: t.api_key,
						username: t.username.trim().to_string(),
					}),
				kick_chat,
			});
		}
		if !streamers.iter().any(StreamerSettings::is_primary) {
			warn!("config: no streamer \"1\" configured; all rewards default to zero");
			streamers.insert(0, StreamerSettings::empty(StreamerId::numbered(1)));
		}

		let event_log = if file.event_log.enabled.unwrap_or(true) {
			EventLogConfig {
				path: Some(
					non_blank(file.event_log.path)
						.map(PathBuf::from)
						.unwrap_or_else(|| data_dir.join("events.log")),
				),
				database_url: non_blank(file.event_log.database_url),
				queue_capacity: file.event_log.queue_capacity.unwrap_or(DEFAULT_EVENT_LOG_QUEUE),
			}
		} else {
			EventLogConfig {
				path: None,
				database_url: None,
				queue_capacity: DEFAULT_EVENT_LOG_QUEUE,
			}
		};

		let defaults = BackoffConfig::default();
		let reconnect = BackoffConfig {
			min_delay: file
				.reconnect
				.min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.min_delay),
			max_delay: file
				.reconnect
				.max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.max_delay),
		};

		Ok(Self {
			server: ServerSettings {
				bind: non_blank(file.server.bind).unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: non_blank(file.server.metrics_bind),
				state_path: non_blank(file.server.state_path)
					.map(PathBuf::from)
					.unwrap_or_else(|| data_dir.join("state.json")),
				tick_persist_every: file.server.tick_persist_every.unwrap_or(DEFAULT_TICK_PERSIST_EVERY).max(1),
				broadcast_capacity: file.server.broadcast_capacity.unwrap_or(DEFAULT_BROADCAST_CAPACITY).max(1),
			},
			start_minutes: file.timer.start_minutes.unwrap_or(DEFAULT_START_MINUTES),
			correlation: CorrelationConfig {
				gift_window: file
					.correlation
					.gift_window_secs
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_GIFT_WINDOW),
				bundle_retention: file
					.correlation
					.bundle_retention_secs
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_BUNDLE_RETENTION),
			}
			.normalized(),
			reconnect,
			event_log,
			streamers,
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_env_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides from `env`. Blank values are ignored.
fn apply_env_overrides_from(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_blank(env(key));

	if let Some(v) = var("SE_TWITCH_TOKEN") {
		cfg.streamer_mut(1).streamelements_token = Some(SecretString::new(v));
		info!("streamer 1: streamelements_token overridden by env");
	}

	if let Some(v) = var("SE_KICK_TOKEN") {
		cfg.streamer_mut(1).streamelements_kick_token = Some(SecretString::new(v));
		info!("streamer 1: streamelements_kick_token overridden by env");
	}

	if let Some(v) = var("SE2_TWITCH_TOKEN") {
		cfg.streamer_mut(2).streamelements_token = Some(SecretString::new(v));
		info!("streamer 2: streamelements_token overridden by env");
	}

	let app_key = var("KICK_APP_KEY");
	let cluster = var("KICK_CLUSTER");
	let chatroom = var("KICK_CHATROOM_ID");
	if app_key.is_some() || cluster.is_some() || chatroom.is_some() {
		let kick = cfg.streamer_mut(1).kick_chat.get_or_insert_with(KickChatSettings::default);
		if let Some(v) = app_key {
			kick.app_key = Some(v);
		}
		if let Some(v) = cluster {
			kick.cluster = Some(v);
		}
		if let Some(v) = chatroom {
			match v.parse::<u64>() {
				Ok(id) => kick.chatroom_id = Some(id),
				Err(e) => warn!(error = %e, "KICK_CHATROOM_ID is not a number; ignored"),
			}
		}
		info!("streamer 1: kick chat overridden by env");
	}

	if let Some(v) = var("SUBATHON_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("SUBATHON_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("SUBATHON_STATE_PATH") {
		cfg.server.state_path = PathBuf::from(v);
		info!("server config: state_path overridden by env");
	}

	if let Some(v) = var("SUBATHON_EVENT_LOG_PATH") {
		cfg.event_log.path = Some(PathBuf::from(v));
		info!("event log: path overridden by env");
	}

	if let Some(v) = var("SUBATHON_EVENT_LOG_DATABASE_URL") {
		cfg.event_log.database_url = Some(v);
		info!("event log: database_url overridden by env");
	}

	if let Some(v) = var("SUBATHON_START_MINUTES")
		&& let Ok(minutes) = v.parse::<u64>()
	{
		cfg.start_minutes = minutes;
		info!(minutes, "timer: start_minutes overridden by env");
	}

	if cfg.reconnect.min_delay > cfg.reconnect.max_delay {
		warn!(
			min_ms = cfg.reconnect.min_delay.as_millis(),
			max_ms = cfg.reconnect.max_delay.as_millis(),
			"reconnect: min_delay > max_delay; swapping"
		);
		std::mem::swap(&mut cfg.reconnect.min_delay, &mut cfg.reconnect.max_delay);
	}

	for s in &cfg.streamers {
		if !s.is_active() {
			warn!(streamer = %s.id, "streamer has no StreamElements token; inactive");
		}
	}
}
