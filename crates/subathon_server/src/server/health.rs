#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use subathon_platform::{ConnectionState, ConnectorStatus};

/// Liveness/readiness plus the last known state of every connector.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	connectors: Arc<Mutex<BTreeMap<String, ConnectorHealth>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorHealth {
	pub state: String,
	pub detail: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
	pub ready: bool,
	pub subscribed: usize,
	pub connectors: BTreeMap<String, ConnectorHealth>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn record_connector(&self, status: &ConnectorStatus) {
		let entry = ConnectorHealth {
			state: status.state.to_string(),
			detail: status.detail.clone(),
			last_error: status.last_error.clone(),
		};
		self.connectors.lock().insert(status.source.to_string(), entry);
	}

	pub fn subscribed_connectors(&self) -> usize {
		let subscribed = ConnectionState::Subscribed.to_string();
		self.connectors.lock().values().filter(|c| c.state == subscribed).count()
	}

	/// Readiness does not depend on connector state.
	pub fn report(&self) -> ReadinessReport {
		ReadinessReport {
			ready: self.is_ready(),
			subscribed: self.subscribed_connectors(),
			connectors: self.connectors.lock().clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::SystemTime;

	use subathon_domain::SourceId;

	use super::*;

	fn status(source: &str, state: ConnectionState, err: Option<&str>) -> ConnectorStatus {
		ConnectorStatus {
			source: SourceId::new(source).unwrap(),
			state,
			detail: "test".to_string(),
			last_error: err.map(str::to_string),
			time: SystemTime::now(),
		}
	}

	#[test]
	fn starts_unready() {
		let h = HealthState::new();
		assert!(!h.is_ready());
		h.mark_ready();
		assert!(h.clone().is_ready());
	}

	#[test]
	fn tracks_latest_status_per_connector() {
		let h = HealthState::new();
		h.record_connector(&status("SE-Twitch1", ConnectionState::Connecting, None));
		h.record_connector(&status("Tipeee-1", ConnectionState::Subscribed, None));
		h.record_connector(&status("SE-Twitch1", ConnectionState::Disconnected, Some("boom")));

		let report = h.report();
		assert_eq!(report.connectors.len(), 2);
		assert_eq!(report.connectors["SE-Twitch1"].last_error.as_deref(), Some("boom"));
		assert_eq!(h.subscribed_connectors(), 1);
	}
}
