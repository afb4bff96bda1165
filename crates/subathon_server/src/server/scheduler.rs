#![forbid(unsafe_code)]

//! Deadline scheduler for gift windows: one task, one min-heap.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::server::accumulator::TimerAccumulator;
use crate::server::correlation::{CorrelationEngine, GroupKey};

const SCHEDULE_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
	at: Instant,
	seq: u64,
	key: GroupKey,
	generation: u64,
}

/// Handle for arming gift-window expiries.
#[derive(Debug, Clone)]
pub struct GiftScheduler {
	tx: mpsc::Sender<(GroupKey, u64, Instant)>,
}

impl GiftScheduler {
	/// Spawn the scheduler task. It drains remaining deadlines after every
	/// handle is dropped, then exits.
	pub fn spawn(engine: Arc<CorrelationEngine>, accumulator: Arc<TimerAccumulator>) -> (Self, JoinHandle<()>) {
		let (tx, rx) = mpsc::channel(SCHEDULE_CHANNEL_CAPACITY);
		let handle = tokio::spawn(run_scheduler(rx, engine, accumulator));
		(Self { tx }, handle)
	}

	pub async fn schedule(&self, key: GroupKey, generation: u64, deadline: Instant) -> anyhow::Result<()> {
		self.tx
			.send((key, generation, deadline))
			.await
			.map_err(|_| anyhow!("gift scheduler stopped"))
	}
}

async fn run_scheduler(
	mut rx: mpsc::Receiver<(GroupKey, u64, Instant)>,
	engine: Arc<CorrelationEngine>,
	accumulator: Arc<TimerAccumulator>,
) {
	let mut heap: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
	let mut next_seq: u64 = 0;
	let mut closed = false;

	loop {
		let next_at = heap.peek().map(|Reverse(d)| d.at);
		if closed && next_at.is_none() {
			break;
		}

		tokio::select! {
			msg = rx.recv(), if !closed => match msg {
				Some((key, generation, at)) => {
					next_seq += 1;
					heap.push(Reverse(Deadline { at, seq: next_seq, key, generation }));
				}
				None => {
					debug!(pending = heap.len(), "gift scheduler input closed; draining");
					closed = true;
				}
			},

			_ = async {
				if let Some(at) = next_at {
					sleep_until(at).await;
				}
			}, if next_at.is_some() => {
				let now = Instant::now();
				while heap.peek().is_some_and(|Reverse(d)| d.at <= now) {
					let Some(Reverse(due)) = heap.pop() else { break };
					if let Some(credit) = engine.expire(&due.key, due.generation, now) {
						debug!(group = %due.key.group_id, streamer = %due.key.streamer, "gift window expired without bundle");
						accumulator.apply_credit(&credit).await;
					}
				}
			}
		}
	}

	info!(pending = engine.pending_len(), "gift scheduler stopped");
}
