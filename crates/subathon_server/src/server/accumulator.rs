#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use subathon_domain::{Credit, TimerSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::server::broadcaster::StateBroadcaster;
use crate::server::snapshot::SnapshotWriter;

pub const DEFAULT_TICK_PERSIST_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorConfig {
	/// Persist the tick path every N ticks.
	pub tick_persist_every: u32,
}

impl Default for AccumulatorConfig {
	fn default() -> Self {
		Self {
			tick_persist_every: DEFAULT_TICK_PERSIST_EVERY,
		}
	}
}

#[derive(Debug)]
struct TimerState {
	remaining: u64,
	paused: bool,

	/// Bumped on every mutation; orders snapshot writes.
	seq: u64,
	ticks_since_persist: u32,
}

impl TimerState {
	fn snapshot(&self) -> TimerSnapshot {
		TimerSnapshot::new(self.remaining, self.paused)
	}
}

type TickWrite = (u64, TimerSnapshot);

/// Owner of the countdown. Every mutation happens under one lock, then
/// persists and broadcasts outside it. Snapshot writes run on the blocking
/// pool.
pub struct TimerAccumulator {
	state: Mutex<TimerState>,
	writer: Arc<SnapshotWriter>,
	broadcaster: StateBroadcaster,
	cfg: AccumulatorConfig,
	tick_tx: mpsc::Sender<TickWrite>,
	tick_rx: Mutex<Option<mpsc::Receiver<TickWrite>>>,
}

impl TimerAccumulator {
	pub fn new(
		initial: TimerSnapshot,
		writer: Arc<SnapshotWriter>,
		broadcaster: StateBroadcaster,
		cfg: AccumulatorConfig,
	) -> Self {
		// Capacity 1: a newer tick write supersedes a queued one anyway.
		let (tick_tx, tick_rx) = mpsc::channel(1);
		Self {
			state: Mutex::new(TimerState {
				remaining: initial.remaining_seconds,
				paused: initial.paused,
				seq: 0,
				ticks_since_persist: 0,
			}),
			writer,
			broadcaster,
			cfg: AccumulatorConfig {
				tick_persist_every: cfg.tick_persist_every.max(1),
			},
			tick_tx,
			tick_rx: Mutex::new(Some(tick_rx)),
		}
	}

	pub fn read_state(&self) -> TimerSnapshot {
		self.state.lock().snapshot()
	}

	pub fn broadcaster(&self) -> &StateBroadcaster {
		&self.broadcaster
	}

	/// One second elapsed.
	pub fn tick(&self) -> TimerSnapshot {
		let (seq, snap, persist_due) = {
			let mut st = self.state.lock();
			if !st.paused && st.remaining > 0 {
				st.remaining -= 1;
			}
			st.seq += 1;
			st.ticks_since_persist += 1;
			let due = st.ticks_since_persist >= self.cfg.tick_persist_every;
			if due {
				st.ticks_since_persist = 0;
			}
			(st.seq, st.snapshot(), due)
		};

		if persist_due && self.tick_tx.try_send((seq, snap)).is_err() {
			debug!(seq, "tick snapshot write still pending; coalescing");
		}
		self.broadcaster.publish(snap);
		snap
	}

	/// Apply a credit. Non-positive credits are ignored.
	pub async fn apply_credit(&self, credit: &Credit) -> Option<TimerSnapshot> {
		if !credit.is_applicable() {
			debug!(source = %credit.source, label = %credit.label, minutes = credit.minutes, "credit discarded");
			return None;
		}

		let seconds = (credit.minutes as u64).saturating_mul(60);
		let snap = self
			.mutate(|st| st.remaining = st.remaining.saturating_add(seconds))
			.await;

		metrics::counter!("subathon_credits_applied_total", "source" => credit.source.to_string()).increment(1);
		metrics::counter!("subathon_credit_minutes_total").increment(credit.minutes as u64);
		info!(
			source = %credit.source,
			label = %credit.label,
			minutes = credit.minutes,
			remaining_minutes = snap.remaining_seconds / 60,
			"credit applied"
		);
		Some(snap)
	}

	/// Signed manual adjustment in minutes; clamps at zero.
	pub async fn apply_manual_delta(&self, minutes: i64) -> TimerSnapshot {
		let delta = minutes.unsigned_abs().saturating_mul(60);
		let snap = self.mutate(|st| {
			st.remaining = if minutes >= 0 {
				st.remaining.saturating_add(delta)
			} else {
				st.remaining.saturating_sub(delta)
			};
		})
		.await;
		info!(minutes, remaining_minutes = snap.remaining_seconds / 60, "manual time change");
		snap
	}

	pub async fn pause(&self) -> TimerSnapshot {
		self.mutate(|st| st.paused = true).await
	}

	pub async fn resume(&self) -> TimerSnapshot {
		self.mutate(|st| st.paused = false).await
	}

	pub async fn toggle(&self) -> TimerSnapshot {
		self.mutate(|st| st.paused = !st.paused).await
	}

	/// Persist the current state now, bypassing tick coalescing.
	pub async fn persist_now(&self) -> TimerSnapshot {
		self.mutate(|_| {}).await
	}

	/// Mutate under the lock, then wait for the snapshot write and broadcast.
	async fn mutate(&self, f: impl FnOnce(&mut TimerState)) -> TimerSnapshot {
		let (seq, snap) = {
			let mut st = self.state.lock();
			f(&mut st);
			st.seq += 1;
			(st.seq, st.snapshot())
		};
		write_off_thread(&self.writer, seq, snap).await;
		self.broadcaster.publish(snap);
		snap
	}

	/// Start the background writer for coalesced tick snapshots.
	pub fn spawn_tick_writer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
		let mut rx = self.tick_rx.lock().take()?;
		let writer = Arc::clone(&self.writer);
		Some(tokio::spawn(async move {
			while let Some((seq, snap)) = rx.recv().await {
				write_off_thread(&writer, seq, snap).await;
			}
			debug!("tick writer exiting");
		}))
	}
}

async fn write_off_thread(writer: &Arc<SnapshotWriter>, seq: u64, snap: TimerSnapshot) {
	let writer = Arc::clone(writer);
	if let Err(e) = tokio::task::spawn_blocking(move || writer.write(seq, &snap)).await {
		warn!(error = %e, seq, "snapshot write task failed");
	}
}

/// Drive `tick()` at `period`.
pub fn spawn_tick_loop(accumulator: Arc<TimerAccumulator>, period: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// The first tick completes immediately.
		interval.tick().await;
		loop {
			interval.tick().await;
			accumulator.tick();
		}
	})
}
