#![forbid(unsafe_code)]

use subathon_domain::TimerSnapshot;
use tokio::sync::broadcast;

pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// SSE event name for state pushes.
pub const TIMER_UPDATE_EVENT: &str = "timer_update";

/// Best-effort fan-out of timer state. Slow observers lag and skip.
#[derive(Debug, Clone)]
pub struct StateBroadcaster {
	tx: broadcast::Sender<TimerSnapshot>,
}

impl Default for StateBroadcaster {
	fn default() -> Self {
		Self::new(DEFAULT_BROADCAST_CAPACITY)
	}
}

impl StateBroadcaster {
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity.max(1));
		Self { tx }
	}

	pub fn publish(&self, snapshot: TimerSnapshot) {
		// No subscribers is fine.
		let _ = self.tx.send(snapshot);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TimerSnapshot> {
		self.tx.subscribe()
	}

	pub fn observers(&self) -> usize {
		self.tx.receiver_count()
	}
}

/// One server-sent event frame.
pub fn sse_frame(snapshot: &TimerSnapshot) -> String {
	let data = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
	format!("event: {TIMER_UPDATE_EVENT}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscribers_receive_published_state() {
		let b = StateBroadcaster::new(4);
		let mut rx = b.subscribe();
		assert_eq!(b.observers(), 1);

		b.publish(TimerSnapshot::new(60, false));
		assert_eq!(rx.recv().await.unwrap(), TimerSnapshot::new(60, false));
	}

	#[test]
	fn publishing_without_subscribers_is_harmless() {
		StateBroadcaster::default().publish(TimerSnapshot::new(1, true));
	}

	#[test]
	fn sse_frame_shape() {
		assert_eq!(
			sse_frame(&TimerSnapshot::new(42, true)),
			"event: timer_update\ndata: {\"remaining\":42,\"paused\":true}\n\n"
		);
	}
}
