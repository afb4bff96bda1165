#![forbid(unsafe_code)]

//! Gift-bundle correlation.
//!
//! A gifted subscription and the bundle purchase it belongs to arrive as two
//! unordered events sharing an activity group. The gifted sub is parked as a
//! [`PendingGift`] for the gift window; whichever of {bundle arrival, window
//! expiry} happens first decides how the group is credited.
//!
//! The engine is synchronous. Time is passed in, and expiries are driven by
//! the caller (see `scheduler`).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use subathon_domain::{Credit, Event, EventKind, RewardRates, SourceId, StreamerId, Tier};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_GIFT_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_BUNDLE_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationConfig {
	pub gift_window: Duration,

	/// How long a group stays marked as settled by its bundle.
	pub bundle_retention: Duration,
}

impl Default for CorrelationConfig {
	fn default() -> Self {
		Self {
			gift_window: DEFAULT_GIFT_WINDOW,
			bundle_retention: DEFAULT_BUNDLE_RETENTION,
		}
	}
}

impl CorrelationConfig {
	/// Retention must outlive the window, otherwise a late gifted sub could
	/// re-open a settled group.
	pub fn normalized(self) -> Self {
		let min_retention = self.gift_window.saturating_mul(2);
		Self {
			gift_window: self.gift_window,
			bundle_retention: self.bundle_retention.max(min_retention),
		}
	}
}

/// Correlation key. Group ids are only unique per streamer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
	pub streamer: StreamerId,
	pub group_id: String,
}

impl GroupKey {
	pub fn new(streamer: StreamerId, group_id: impl Into<String>) -> Self {
		Self {
			streamer,
			group_id: group_id.into(),
		}
	}
}

/// Provisional credit for a gifted subscription awaiting its bundle.
#[derive(Debug, Clone)]
pub struct PendingGift {
	pub source: SourceId,
	pub tier: Tier,
	pub minutes: i64,
	pub created_at: Instant,
	pub generation: u64,
}

/// What to do with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
	Credit(Credit),

	/// Parked; call [`CorrelationEngine::expire`] with `key`/`generation` at `deadline`.
	Deferred {
		key: GroupKey,
		generation: u64,
		deadline: Instant,
	},

	Discard(&'static str),
}

#[derive(Debug, Default)]
struct BundleMarker {
	marked_at: HashMap<GroupKey, Instant>,
}

impl BundleMarker {
	fn is_marked(&self, key: &GroupKey, now: Instant, retention: Duration) -> bool {
		self.marked_at
			.get(key)
			.is_some_and(|at| now.saturating_duration_since(*at) < retention)
	}

	/// Returns `false` if the group was already marked.
	fn mark(&mut self, key: GroupKey, now: Instant, retention: Duration) -> bool {
		self.marked_at
			.retain(|_, at| now.saturating_duration_since(*at) < retention);
		match self.marked_at.entry(key) {
			std::collections::hash_map::Entry::Occupied(_) => false,
			std::collections::hash_map::Entry::Vacant(v) => {
				v.insert(now);
				true
			}
		}
	}
}

#[derive(Debug, Default)]
struct PendingTable {
	gifts: HashMap<GroupKey, PendingGift>,
	next_generation: u64,
}

/// Gift-bundle correlation state machine.
///
/// Lock order is always `bundles` then `pending`.
#[derive(Debug, Default)]
pub struct CorrelationEngine {
	cfg: CorrelationConfig,
	bundles: Mutex<BundleMarker>,
	pending: Mutex<PendingTable>,
}

impl CorrelationEngine {
	pub fn new(cfg: CorrelationConfig) -> Self {
		Self {
			cfg: cfg.normalized(),
			bundles: Mutex::new(BundleMarker::default()),
			pending: Mutex::new(PendingTable::default()),
		}
	}

	pub fn pending_len(&self) -> usize {
		self.pending.lock().gifts.len()
	}

	/// Classify one event.
	pub fn process(&self, event: &Event, now: Instant) -> Decision {
		let rates = event.rates.as_ref();
		let source = event.source.clone();

		match &event.kind {
			EventKind::Subscription {
				tier,
				gifted: false,
				amount,
			} => {
				let minutes = sub_minutes(rates, *tier).saturating_mul((*amount).max(1));
				Decision::Credit(Credit::new(minutes, format!("sub {tier}"), source))
			}

			EventKind::Subscription { tier, gifted: true, .. } => {
				let minutes = sub_minutes(rates, *tier);
				let Some(group_id) = event.group_id.as_deref() else {
					return Decision::Credit(Credit::new(minutes, format!("gifted_sub {tier}"), source));
				};
				let key = GroupKey::new(event.streamer.clone(), group_id);
				self.park_gift(key, source, *tier, minutes, now)
			}

			EventKind::GiftBundle { tier, count } => {
				let minutes = sub_minutes(rates, *tier).saturating_mul((*count).max(0));
				let credit = Credit::new(minutes, format!("gift_bundle {count}x {tier}"), source);
				match event.group_id.as_deref() {
					Some(group_id) => self.settle_bundle(GroupKey::new(event.streamer.clone(), group_id), credit, now),
					None => Decision::Credit(credit),
				}
			}

			EventKind::Cheer { bits } => {
				let rate = rates.bits_per_100().unwrap_or(0);
				let minutes = ((*bits).max(0) / 100).saturating_mul(rate);
				Decision::Credit(Credit::new(minutes, format!("cheer {bits}"), source))
			}

			EventKind::Donation { amount } => {
				let rate = rates.tipeee.map(|r| r.minutes_per_eur).unwrap_or(0.0);
				Decision::Credit(Credit::new(currency_minutes(*amount, rate), format!("donation {amount:.2}"), source))
			}

			EventKind::Tip { amount } => {
				let rate = rates.streamelements.map(|r| r.minutes_per_eur).unwrap_or(0.0);
				Decision::Credit(Credit::new(currency_minutes(*amount, rate), format!("tip {amount:.2}"), source))
			}

			EventKind::KickGiftChat { amount } => {
				let rate = rates.kicks_per_100().unwrap_or(0);
				let minutes = ((*amount).max(0) / 100).saturating_mul(rate);
				Decision::Credit(Credit::new(minutes, format!("kick_gift {amount}"), source))
			}
		}
	}

	fn park_gift(&self, key: GroupKey, source: SourceId, tier: Tier, minutes: i64, now: Instant) -> Decision {
		let bundles = self.bundles.lock();
		if bundles.is_marked(&key, now, self.cfg.bundle_retention) {
			debug!(group = %key.group_id, streamer = %key.streamer, "gifted sub for settled group ignored");
			return Decision::Discard("group already settled by bundle");
		}

		let mut pending = self.pending.lock();
		pending.next_generation += 1;
		let generation = pending.next_generation;
		let replaced = pending
			.gifts
			.insert(
				key.clone(),
				PendingGift {
					source,
					tier,
					minutes,
					created_at: now,
					generation,
				},
			)
			.is_some();
		metrics::gauge!("subathon_pending_gifts").set(pending.gifts.len() as f64);
		drop(pending);
		drop(bundles);

		debug!(group = %key.group_id, streamer = %key.streamer, generation, replaced, "gifted sub parked");
		Decision::Deferred {
			key,
			generation,
			deadline: now + self.cfg.gift_window,
		}
	}

	fn settle_bundle(&self, key: GroupKey, credit: Credit, now: Instant) -> Decision {
		let mut bundles = self.bundles.lock();
		if !bundles.mark(key.clone(), now, self.cfg.bundle_retention) {
			debug!(group = %key.group_id, streamer = %key.streamer, "duplicate gift bundle ignored");
			return Decision::Discard("duplicate gift bundle");
		}

		let mut pending = self.pending.lock();
		if let Some(gift) = pending.gifts.remove(&key) {
			debug!(
				group = %key.group_id,
				waited_ms = now.saturating_duration_since(gift.created_at).as_millis() as u64,
				"bundle superseded pending gifted sub"
			);
		}
		metrics::gauge!("subathon_pending_gifts").set(pending.gifts.len() as f64);

		Decision::Credit(credit)
	}

	/// Window expiry for `key`. Credits the parked gift once, and only if it
	/// is still the generation that armed this deadline.
	pub fn expire(&self, key: &GroupKey, generation: u64, now: Instant) -> Option<Credit> {
		let bundles = self.bundles.lock();
		let mut pending = self.pending.lock();

		if pending.gifts.get(key).map(|g| g.generation) != Some(generation) {
			return None;
		}
		let gift = pending.gifts.remove(key)?;
		metrics::gauge!("subathon_pending_gifts").set(pending.gifts.len() as f64);

		if bundles.is_marked(key, now, self.cfg.bundle_retention) {
			return None;
		}

		Some(Credit::new(gift.minutes, format!("gifted_sub {}", gift.tier), gift.source))
	}
}

/// Minutes for one subscription, on every platform.
fn sub_minutes(rates: &RewardRates, tier: Tier) -> i64 {
	rates.tier_minutes(tier).unwrap_or(0)
}

fn currency_minutes(amount: f64, rate: f64) -> i64 {
	let minutes = (amount * rate).floor();
	if minutes.is_finite() { minutes as i64 } else { 0 }
}
