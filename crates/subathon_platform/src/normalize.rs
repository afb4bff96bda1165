#![forbid(unsafe_code)]

//! Raw provider payload → canonical [`Event`].
//!
//! Pure: no I/O, no clocks. Anything unrecognized yields `None`.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use subathon_domain::{Event, EventKind, RewardRates, Tier};

use crate::{RawBody, RawPayload};

/// Map one raw payload onto an event, or discard it.
pub fn normalize(payload: &RawPayload, rates: Arc<RewardRates>) -> Option<Event> {
	let (kind, group_id) = match &payload.body {
		RawBody::Activity(activity) => normalize_activity(activity)?,
		RawBody::Chat { text, .. } => {
			let amount = parse_kick_gift_chat(text)?;
			(EventKind::KickGiftChat { amount }, None)
		}
	};

	Some(
		Event::new(
			payload.source.clone(),
			payload.platform,
			payload.streamer.clone(),
			kind,
			rates,
		)
		.with_group_id(group_id),
	)
}

fn normalize_activity(activity: &Value) -> Option<(EventKind, Option<String>)> {
	let kind = activity.get("type")?.as_str()?;
	let data = activity.get("data").unwrap_or(&Value::Null);

	let event = match kind {
		"subscriber" => EventKind::Subscription {
			tier: tier_value(data.get("tier")),
			gifted: bool_value(data.get("gifted")).unwrap_or(false),
			amount: int_value(data.get("amount")).unwrap_or(1),
		},
		"cheer" => EventKind::Cheer {
			bits: int_value(data.get("amount")).unwrap_or(0),
		},
		"communityGiftPurchase" => EventKind::GiftBundle {
			tier: tier_value(data.get("tier")),
			count: int_value(data.get("amount")).unwrap_or(0),
		},
		"tip" => EventKind::Tip {
			amount: float_value(data.get("amount")).unwrap_or(0.0),
		},
		"donation" => EventKind::Donation {
			amount: float_value(activity.get("amount"))
				.or_else(|| float_value(data.get("amount")))
				.unwrap_or(0.0),
		},
		"kick_gift" => EventKind::KickGiftChat {
			amount: int_value(activity.get("amount")).unwrap_or(0),
		},
		_ => return None,
	};

	let group_id = string_value(activity.get("activityGroup")).or_else(|| string_value(data.get("activityGroup")));
	Some((event, group_id))
}

static KICK_GIFT_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(?i)gifted\s+([0-9]+)\s+kick").expect("kick gift regex is valid"));

/// Scan a chat line for `gifted <N> KICK...` (case-insensitive).
///
/// Returns `Some(0)` when the count does not fit in an `i64`.
pub fn parse_kick_gift_chat(text: &str) -> Option<i64> {
	let caps = KICK_GIFT_RE.captures(text)?;
	Some(caps[1].parse::<i64>().unwrap_or(0))
}

fn tier_value(v: Option<&Value>) -> Tier {
	match v {
		Some(Value::String(s)) => Tier::from_provider(s),
		Some(Value::Number(n)) => Tier::from_provider(&n.to_string()),
		_ => Tier::One,
	}
}

fn int_value(v: Option<&Value>) -> Option<i64> {
	match v? {
		Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
		Value::String(s) => {
			let s = s.trim();
			s.parse::<i64>()
				.ok()
				.or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
		}
		_ => None,
	}
}

fn float_value(v: Option<&Value>) -> Option<f64> {
	let f = match v? {
		Value::Number(n) => n.as_f64()?,
		Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok()?,
		_ => return None,
	};
	f.is_finite().then_some(f)
}

fn bool_value(v: Option<&Value>) -> Option<bool> {
	match v? {
		Value::Bool(b) => Some(*b),
		Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
			"true" | "1" => Some(true),
			"false" | "0" => Some(false),
			_ => None,
		},
		Value::Number(n) => n.as_i64().map(|n| n != 0),
		_ => None,
	}
}

fn string_value(v: Option<&Value>) -> Option<String> {
	match v? {
		Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use subathon_domain::{Platform, SourceId, StreamerId};

	use super::*;
	use crate::ConnectorIdentity;

	fn payload(body: RawBody) -> RawPayload {
		let identity = ConnectorIdentity::new(
			SourceId::new("SE-Twitch1").unwrap(),
			Platform::Twitch,
			StreamerId::new("1").unwrap(),
		);
		RawPayload::new(&identity, "session", body)
	}

	fn kind_of(activity: Value) -> Option<EventKind> {
		normalize(&payload(RawBody::Activity(activity)), Arc::default()).map(|e| e.kind)
	}

	#[test]
	fn subscriber_with_defaults() {
		assert_eq!(
			kind_of(json!({"type": "subscriber", "data": {}})),
			Some(EventKind::Subscription {
				tier: Tier::One,
				gifted: false,
				amount: 1
			})
		);
	}

	#[test]
	fn subscriber_tier_amount_and_gifted() {
		assert_eq!(
			kind_of(json!({"type": "subscriber", "data": {"tier": 3000, "amount": "6", "gifted": true}})),
			Some(EventKind::Subscription {
				tier: Tier::Three,
				gifted: true,
				amount: 6
			})
		);
		assert_eq!(
			kind_of(json!({"type": "subscriber", "data": {"tier": "PRIME"}})),
			Some(EventKind::Subscription {
				tier: Tier::One,
				gifted: false,
				amount: 1
			})
		);
	}

	#[test]
	fn cheer_and_gift_bundle_default_to_zero() {
		assert_eq!(
			kind_of(json!({"type": "cheer", "data": {"amount": "lots"}})),
			Some(EventKind::Cheer { bits: 0 })
		);
		assert_eq!(
			kind_of(json!({"type": "communityGiftPurchase", "data": {"tier": "2000"}})),
			Some(EventKind::GiftBundle {
				tier: Tier::Two,
				count: 0
			})
		);
	}

	#[test]
	fn donation_reads_top_level_then_data_amount() {
		assert_eq!(
			kind_of(json!({"type": "donation", "amount": 7.5})),
			Some(EventKind::Donation { amount: 7.5 })
		);
		assert_eq!(
			kind_of(json!({"type": "donation", "data": {"amount": "3,20"}})),
			Some(EventKind::Donation { amount: 3.2 })
		);
		assert_eq!(
			kind_of(json!({"type": "tip", "data": {"amount": 10}})),
			Some(EventKind::Tip { amount: 10.0 })
		);
	}

	#[test]
	fn kick_gift_activity_uses_top_level_amount() {
		assert_eq!(
			kind_of(json!({"type": "kick_gift", "amount": 500})),
			Some(EventKind::KickGiftChat { amount: 500 })
		);
	}

	#[test]
	fn unknown_or_untyped_activities_are_discarded() {
		assert_eq!(kind_of(json!({"type": "follow", "data": {}})), None);
		assert_eq!(kind_of(json!({"data": {}})), None);
		assert_eq!(kind_of(json!("nope")), None);
	}

	#[test]
	fn group_id_from_top_level_or_data() {
		let ev = normalize(
			&payload(RawBody::Activity(
				json!({"type": "subscriber", "activityGroup": "g1", "data": {"gifted": true}}),
			)),
			Arc::default(),
		)
		.unwrap();
		assert_eq!(ev.group_id.as_deref(), Some("g1"));

		let ev = normalize(
			&payload(RawBody::Activity(
				json!({"type": "communityGiftPurchase", "data": {"amount": 5, "activityGroup": "g2"}}),
			)),
			Arc::default(),
		)
		.unwrap();
		assert_eq!(ev.group_id.as_deref(), Some("g2"));
	}

	#[test]
	fn chat_pattern_matches_case_insensitively() {
		assert_eq!(parse_kick_gift_chat("alice GIFTED 500 kicks!"), Some(500));
		assert_eq!(parse_kick_gift_chat("@bob just gifted 100 KICK"), Some(100));
		assert_eq!(parse_kick_gift_chat("gifted 99999999999999999999999 KICKs"), Some(0));
		assert_eq!(parse_kick_gift_chat("gifted many KICKs"), None);
		assert_eq!(parse_kick_gift_chat("hello chat"), None);
		assert_eq!(parse_kick_gift_chat("gifted 500"), None);
		assert_eq!(parse_kick_gift_chat("gifted\t42  kick"), Some(42));
		assert_eq!(parse_kick_gift_chat("gifted ١٢ KICKs"), None);
	}

	#[test]
	fn chat_payload_becomes_kick_gift_event() {
		let ev = normalize(
			&payload(RawBody::Chat {
				text: "carol gifted 300 KICKs".to_string(),
				sender: None,
			}),
			Arc::default(),
		)
		.unwrap();
		assert_eq!(ev.kind, EventKind::KickGiftChat { amount: 300 });

		let none = normalize(
			&payload(RawBody::Chat {
				text: "gg".to_string(),
				sender: None,
			}),
			Arc::default(),
		);
		assert!(none.is_none());
	}

	mod props {
		use proptest::prelude::*;

		use super::super::parse_kick_gift_chat;

		proptest! {
			#[test]
			fn gift_lines_round_trip_their_count(n in 0i64..1_000_000, prefix in "[a-z]{0,8}") {
				let line = format!("{prefix} gifted {n} KICKs");
				prop_assert_eq!(parse_kick_gift_chat(&line), Some(n));
			}

			#[test]
			fn lines_without_gifted_never_match(s in "[a-fh-z0-9 ]{0,40}") {
				prop_assert_eq!(parse_kick_gift_chat(&s), None);
			}
		}
	}
}
