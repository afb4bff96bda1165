#![forbid(unsafe_code)]

pub mod rewards;

use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rewards::{CurrencyReward, KickRewards, RewardEntry, RewardMinutes, RewardRates, TwitchRewards};

/// Platforms a tracked streamer can be monetized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	Kick,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::Kick => "kick",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"kick" => Ok(Platform::Kick),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Tracked streamer identifier (`"1"`, `"2"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamerId(String);

impl StreamerId {
	/// Create a non-empty `StreamerId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	/// `"1"`, `"2"`, ...
	pub fn numbered(n: u32) -> Self {
		Self(n.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for StreamerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for StreamerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		StreamerId::new(s.to_string())
	}
}

/// Connector instance identifier (e.g. `SE-Twitch1`, `Kick-chat-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
	/// Create a non-empty `SourceId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
	One,
	Two,
	Three,
}

impl Tier {
	/// Map a provider tier string onto a tier.
	///
	/// `"1000"` and `"prime"` are tier 1, `"2000"` tier 2, `"3000"` tier 3.
	/// Anything else falls back to tier 1.
	pub fn from_provider(raw: &str) -> Self {
		match raw.trim().to_ascii_lowercase().as_str() {
			"2000" => Tier::Two,
			"3000" => Tier::Three,
			_ => Tier::One,
		}
	}

	pub const fn as_u8(self) -> u8 {
		match self {
			Tier::One => 1,
			Tier::Two => 2,
			Tier::Three => 3,
		}
	}
}

impl fmt::Display for Tier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "T{}", self.as_u8())
	}
}

/// Canonical event variants produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
	/// `amount` models multi-month resubscriptions.
	Subscription { tier: Tier, gifted: bool, amount: i64 },
	GiftBundle { tier: Tier, count: i64 },
	Cheer { bits: i64 },
	Donation { amount: f64 },
	Tip { amount: f64 },
	KickGiftChat { amount: i64 },
}

impl EventKind {
	/// Short label used for credit bookkeeping and logs.
	pub fn label(&self) -> &'static str {
		match self {
			EventKind::Subscription { gifted: false, .. } => "sub",
			EventKind::Subscription { gifted: true, .. } => "gifted_sub",
			EventKind::GiftBundle { .. } => "gift_bundle",
			EventKind::Cheer { .. } => "cheer",
			EventKind::Donation { .. } => "donation",
			EventKind::Tip { .. } => "tip",
			EventKind::KickGiftChat { .. } => "kick_gift",
		}
	}
}

/// Canonical monetization event. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Event {
	pub source: SourceId,
	pub platform: Platform,
	pub streamer: StreamerId,
	pub kind: EventKind,

	/// Correlation key shared by a gifted subscription and its bundle.
	pub group_id: Option<String>,

	/// Reward rates of the owning streamer.
	pub rates: Arc<RewardRates>,
}

impl Event {
	pub fn new(
		source: SourceId,
		platform: Platform,
		streamer: StreamerId,
		kind: EventKind,
		rates: Arc<RewardRates>,
	) -> Self {
		Self {
			source,
			platform,
			streamer,
			kind,
			group_id: None,
			rates,
		}
	}

	pub fn with_group_id(mut self, group_id: Option<String>) -> Self {
		self.group_id = group_id.filter(|g| !g.trim().is_empty());
		self
	}
}

/// Minutes to add to the countdown. The only unit of timer mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
	pub minutes: i64,
	pub label: String,
	pub source: SourceId,
}

impl Credit {
	pub fn new(minutes: i64, label: impl Into<String>, source: SourceId) -> Self {
		Self {
			minutes,
			label: label.into(),
			source,
		}
	}

	/// Zero or negative credits are never applied.
	pub fn is_applicable(&self) -> bool {
		self.minutes > 0
	}
}

/// Observable countdown state, as persisted and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimerSnapshot {
	#[serde(rename = "remaining", alias = "remaining_seconds")]
	pub remaining_seconds: u64,
	#[serde(default)]
	pub paused: bool,
}

impl TimerSnapshot {
	pub fn new(remaining_seconds: u64, paused: bool) -> Self {
		Self {
			remaining_seconds,
			paused,
		}
	}
}
