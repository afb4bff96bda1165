#![forbid(unsafe_code)]

//! Connector → normalizer → correlation → accumulator wiring.

use std::sync::Arc;

use subathon_domain::{RewardRates, SourceId};
use subathon_platform::{
	ConnectionState, Connector, ConnectorControl, ConnectorControlTx, ConnectorEvent, ConnectorStatus, RawPayload,
	normalize,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::accumulator::TimerAccumulator;
use crate::server::correlation::{CorrelationEngine, Decision};
use crate::server::event_log::EventLog;
use crate::server::health::HealthState;
use crate::server::scheduler::GiftScheduler;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
	pub control_channel_capacity: usize,
	pub connector_events_channel_capacity: usize,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			control_channel_capacity: 8,
			connector_events_channel_capacity: 1_024,
		}
	}
}

/// A connector plus the reward rates of the streamer it belongs to.
pub struct ConnectorSpec {
	pub connector: Box<dyn Connector>,
	pub rates: Arc<RewardRates>,
}

/// Shared processing stages.
#[derive(Clone)]
pub struct PipelineContext {
	pub engine: Arc<CorrelationEngine>,
	pub scheduler: GiftScheduler,
	pub accumulator: Arc<TimerAccumulator>,
	pub event_log: EventLog,
	pub health: HealthState,
}

impl PipelineContext {
	/// Run one raw payload through every stage.
	pub async fn handle_payload(&self, payload: &RawPayload, rates: &Arc<RewardRates>) {
		self.event_log.record(payload);
		debug!(source = %payload.source, body = %payload.body.to_log_json(), "raw event");

		let Some(event) = normalize(payload, Arc::clone(rates)) else {
			debug!(source = %payload.source, "payload discarded by normalizer");
			return;
		};

		match self.engine.process(&event, Instant::now()) {
			Decision::Credit(credit) => {
				self.accumulator.apply_credit(&credit).await;
			}
			Decision::Deferred {
				key,
				generation,
				deadline,
			} => {
				if let Err(e) = self.scheduler.schedule(key, generation, deadline).await {
					warn!(source = %event.source, error = %e, "could not arm gift window");
				}
			}
			Decision::Discard(reason) => {
				debug!(source = %event.source, kind = event.kind.label(), reason, "event discarded");
			}
		}
	}
}

/// Running connectors.
pub struct Pipeline {
	controls: Vec<(SourceId, ConnectorControlTx)>,
}

impl Pipeline {
	/// Spawn every connector with its own forwarding task.
	pub fn start(connectors: Vec<ConnectorSpec>, ctx: PipelineContext, cfg: PipelineConfig) -> Self {
		let mut controls = Vec::with_capacity(connectors.len());

		for spec in connectors {
			let source = spec.connector.identity().source.clone();
			let (control_tx, control_rx) = mpsc::channel::<ConnectorControl>(cfg.control_channel_capacity);
			let (events_tx, events_rx) = mpsc::channel::<ConnectorEvent>(cfg.connector_events_channel_capacity);

			let run_source = source.clone();
			let connector = spec.connector;
			tokio::spawn(async move {
				if let Err(e) = connector.run(control_rx, events_tx).await {
					warn!(source = %run_source, error = %e, "connector task exited with error");
				}
			});

			Self::spawn_forwarder(source.clone(), events_rx, ctx.clone(), spec.rates);
			info!(%source, "connector started");
			controls.push((source, control_tx));
		}

		Self { controls }
	}

	fn spawn_forwarder(
		source: SourceId,
		mut events_rx: mpsc::Receiver<ConnectorEvent>,
		ctx: PipelineContext,
		rates: Arc<RewardRates>,
	) {
		tokio::spawn(async move {
			while let Some(ev) = events_rx.recv().await {
				match ev {
					ConnectorEvent::Payload(payload) => ctx.handle_payload(&payload, &rates).await,
					ConnectorEvent::Status(st) => {
							ctx.health.record_connector(&st);
							record_status(&st);
						}
				}
			}
			debug!(%source, "connector events channel closed; forwarder exiting");
		});
	}

	pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
		self.controls.iter().map(|(s, _)| s)
	}

	/// Ask every connector to stop.
	pub async fn shutdown(self) {
		for (source, ctrl) in self.controls {
			let _ = ctrl.send(ConnectorControl::Shutdown).await;
			debug!(%source, "sent connector Shutdown");
		}
	}
}

fn record_status(st: &ConnectorStatus) {
	let source = st.source.to_string();
	metrics::counter!("subathon_connector_status_total", "source" => source.clone()).increment(1);
	metrics::gauge!("subathon_connector_subscribed", "source" => source.clone()).set(
		if st.state == ConnectionState::Subscribed { 1.0 } else { 0.0 },
	);
	if st.last_error.is_some() {
		metrics::counter!("subathon_connector_errors_total", "source" => source).increment(1);
		warn!(
			source = %st.source,
			state = %st.state,
			detail = %st.detail,
			last_error = ?st.last_error,
			"connector status"
		);
	} else {
		debug!(source = %st.source, state = %st.state, detail = %st.detail, "connector status");
	}
}
