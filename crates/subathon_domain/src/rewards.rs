#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::Tier;

/// Per-streamer reward rates. Every category is optional; a missing
/// category credits nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardRates {
	#[serde(default)]
	pub twitch: Option<TwitchRewards>,
	#[serde(default)]
	pub tipeee: Option<CurrencyReward>,
	#[serde(default)]
	pub streamelements: Option<CurrencyReward>,
	#[serde(default)]
	pub kick: Option<KickRewards>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwitchRewards {
	#[serde(default)]
	pub sub_t1: i64,
	#[serde(default)]
	pub sub_t2: i64,
	#[serde(default)]
	pub sub_t3: i64,
	#[serde(default)]
	pub bits_per_100: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrencyReward {
	#[serde(default)]
	pub minutes_per_eur: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickRewards {
	#[serde(default)]
	pub sub: i64,
	#[serde(default)]
	pub kicks_per_100: i64,
}

impl RewardRates {
	/// Minutes for one subscription of `tier`.
	pub fn tier_minutes(&self, tier: Tier) -> Option<i64> {
		let twitch = self.twitch.as_ref()?;
		Some(match tier {
			Tier::One => twitch.sub_t1,
			Tier::Two => twitch.sub_t2,
			Tier::Three => twitch.sub_t3,
		})
	}

	pub fn bits_per_100(&self) -> Option<i64> {
		self.twitch.as_ref().map(|t| t.bits_per_100)
	}

	pub fn kicks_per_100(&self) -> Option<i64> {
		self.kick.as_ref().map(|k| k.kicks_per_100)
	}

	/// Rewards listing shown to viewers, in display order.
	pub fn entries(&self) -> Vec<RewardEntry> {
		let mut out = Vec::new();

		if let Some(twitch) = &self.twitch {
			out.push(RewardEntry::whole("T 1 Sub", twitch.sub_t1));
			out.push(RewardEntry::whole("T 2 Sub", twitch.sub_t2));
			out.push(RewardEntry::whole("T 3 Sub", twitch.sub_t3));
			out.push(RewardEntry::whole("100 Bits", twitch.bits_per_100));
		}
		if let Some(tipeee) = &self.tipeee {
			out.push(RewardEntry::currency("1 € Donation", tipeee.minutes_per_eur));
		}
		if let Some(se) = &self.streamelements {
			out.push(RewardEntry::currency("1 € Donation", se.minutes_per_eur));
		}
		if let Some(kick) = &self.kick {
			out.push(RewardEntry::whole("Kick Sub", kick.sub));
			out.push(RewardEntry::whole("100 Kicks", kick.kicks_per_100));
		}

		out
	}
}

/// Minutes as shown in the rewards listing. Whole numbers stay integers on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RewardMinutes {
	Whole(i64),
	Fractional(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEntry {
	pub name: String,
	pub minutes: RewardMinutes,
}

impl RewardEntry {
	fn whole(name: &str, minutes: i64) -> Self {
		Self {
			name: name.to_string(),
			minutes: RewardMinutes::Whole(minutes),
		}
	}

	fn currency(name: &str, minutes: f64) -> Self {
		let minutes = if minutes.fract() == 0.0 && minutes.abs() < i64::MAX as f64 {
			RewardMinutes::Whole(minutes as i64)
		} else {
			RewardMinutes::Fractional(minutes)
		};
		Self {
			name: name.to_string(),
			minutes,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn full_rates() -> RewardRates {
		RewardRates {
			twitch: Some(TwitchRewards {
				sub_t1: 5,
				sub_t2: 10,
				sub_t3: 25,
				bits_per_100: 1,
			}),
			tipeee: Some(CurrencyReward { minutes_per_eur: 1.5 }),
			streamelements: None,
			kick: Some(KickRewards { sub: 4, kicks_per_100: 2 }),
		}
	}

	#[test]
	fn tier_minutes_require_twitch_section() {
		let rates = full_rates();
		assert_eq!(rates.tier_minutes(Tier::Two), Some(10));
		assert_eq!(RewardRates::default().tier_minutes(Tier::One), None);
	}

	#[test]
	fn entries_follow_display_order() {
		let names: Vec<String> = full_rates().entries().into_iter().map(|e| e.name).collect();
		assert_eq!(
			names,
			vec!["T 1 Sub", "T 2 Sub", "T 3 Sub", "100 Bits", "1 € Donation", "Kick Sub", "100 Kicks"]
		);
	}

	#[test]
	fn whole_currency_rates_serialize_as_integers() {
		let rates = RewardRates {
			streamelements: Some(CurrencyReward { minutes_per_eur: 2.0 }),
			..RewardRates::default()
		};
		let json = serde_json::to_value(rates.entries()).unwrap();
		assert_eq!(json, serde_json::json!([{"name": "1 € Donation", "minutes": 2}]));

		let json = serde_json::to_value(full_rates().entries()).unwrap();
		assert_eq!(json[4]["minutes"], serde_json::json!(1.5));
	}

	#[test]
	fn parses_partial_toml_style_json() {
		let rates: RewardRates = serde_json::from_str(r#"{"twitch": {"sub_t1": 5}}"#).unwrap();
		assert_eq!(rates.tier_minutes(Tier::One), Some(5));
		assert_eq!(rates.tier_minutes(Tier::Three), Some(0));
		assert!(rates.kick.is_none());
	}
}
