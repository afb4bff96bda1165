#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
	pub min_delay: Duration,
	pub max_delay: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			min_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(60),
		}
	}
}

impl BackoffConfig {
	/// Swap inverted bounds instead of rejecting them.
	pub fn normalized(self) -> Self {
		if self.min_delay > self.max_delay {
			Self {
				min_delay: self.max_delay,
				max_delay: self.min_delay,
			}
		} else {
			self
		}
	}
}

/// Jittered exponential backoff. Never gives up.
///
/// The delay for attempt `n` is drawn uniformly from `[cap/2, cap]` where
/// `cap = min(min_delay * 2^n, max_delay)`.
#[derive(Debug, Clone)]
pub struct Backoff {
	cfg: BackoffConfig,
	attempt: u32,
}

impl Backoff {
	pub fn new(cfg: BackoffConfig) -> Self {
		Self {
			cfg: cfg.normalized(),
			attempt: 0,
		}
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	/// Forget past failures (called once a connection is subscribed).
	pub fn reset(&mut self) {
		self.attempt = 0;
	}

	/// Upper bound for the current attempt, before jitter.
	pub fn ceiling(&self) -> Duration {
		let pow = self.attempt.min(16);
		let ms = self.cfg.min_delay.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(self.cfg.max_delay).max(self.cfg.min_delay)
	}

	/// Delay before the next attempt; advances the attempt counter.
	pub fn next_delay(&mut self) -> Duration {
		self.next_delay_with(&mut rand::rng())
	}

	pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
		let cap = self.ceiling().as_millis() as u64;
		let floor = cap / 2;
		let ms = if cap > floor { rng.random_range(floor..=cap) } else { cap };
		self.attempt = self.attempt.saturating_add(1);
		Duration::from_millis(ms)
	}
}

#[cfg(test)]
mod tests {
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	use super::*;

	fn cfg(min_ms: u64, max_ms: u64) -> BackoffConfig {
		BackoffConfig {
			min_delay: Duration::from_millis(min_ms),
			max_delay: Duration::from_millis(max_ms),
		}
	}

	#[test]
	fn ceiling_grows_exponentially_and_caps() {
		let mut b = Backoff::new(cfg(500, 4_000));
		let mut rng = StdRng::seed_from_u64(7);
		let mut ceilings = Vec::new();
		for _ in 0..6 {
			ceilings.push(b.ceiling().as_millis() as u64);
			b.next_delay_with(&mut rng);
		}
		assert_eq!(ceilings, vec![500, 1_000, 2_000, 4_000, 4_000, 4_000]);
	}

	#[test]
	fn jittered_delay_stays_within_half_to_full_ceiling() {
		let mut b = Backoff::new(cfg(1_000, 30_000));
		let mut rng = StdRng::seed_from_u64(42);
		for _ in 0..64 {
			let cap = b.ceiling();
			let d = b.next_delay_with(&mut rng);
			assert!(d <= cap, "{d:?} > {cap:?}");
			assert!(d >= cap / 2, "{d:?} < {:?}", cap / 2);
		}
	}

	#[test]
	fn reset_returns_to_min_delay() {
		let mut b = Backoff::new(cfg(200, 10_000));
		for _ in 0..5 {
			b.next_delay();
		}
		assert_eq!(b.attempt(), 5);
		b.reset();
		assert_eq!(b.ceiling(), Duration::from_millis(200));
	}

	#[test]
	fn inverted_bounds_are_swapped() {
		let b = Backoff::new(cfg(9_000, 1_000));
		assert_eq!(b.ceiling(), Duration::from_millis(1_000));
	}

	#[test]
	fn huge_attempt_counts_do_not_overflow() {
		let mut b = Backoff::new(cfg(1_000, 60_000));
		let mut rng = StdRng::seed_from_u64(1);
		for _ in 0..10_000 {
			b.next_delay_with(&mut rng);
		}
		assert_eq!(b.ceiling(), Duration::from_secs(60));
	}
}
