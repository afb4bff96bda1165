#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use serde_json::{Value, json};
use subathon_domain::{CurrencyReward, KickRewards, RewardRates, StreamerId, TimerSnapshot, TwitchRewards};

use crate::server::accumulator::{AccumulatorConfig, TimerAccumulator};
use crate::server::broadcaster::StateBroadcaster;
use crate::server::health::HealthState;
use crate::server::http::{HttpBody, HttpState, ManualDeltaError, parse_manual_delta, route};
use crate::server::snapshot::{InMemoryStore, SnapshotWriter};

fn state(remaining: u64) -> HttpState {
	let writer = Arc::new(SnapshotWriter::new(Arc::new(InMemoryStore::default())));
	let accumulator = Arc::new(TimerAccumulator::new(
		TimerSnapshot::new(remaining, false),
		writer,
		StateBroadcaster::new(16),
		AccumulatorConfig::default(),
	));

	let mut rewards = BTreeMap::new();
	rewards.insert(
		StreamerId::new("1").unwrap(),
		Arc::new(RewardRates {
			twitch: Some(TwitchRewards {
				sub_t1: 5,
				sub_t2: 10,
				sub_t3: 25,
				bits_per_100: 1,
			}),
			streamelements: Some(CurrencyReward { minutes_per_eur: 1.5 }),
			kick: Some(KickRewards {
				sub: 5,
				kicks_per_100: 1,
			}),
			..RewardRates::default()
		}),
	);

	HttpState {
		accumulator,
		rewards: Arc::new(rewards),
		health: HealthState::new(),
	}
}

async fn get(state: &HttpState, path: &str, query: Option<&str>) -> hyper::Response<HttpBody> {
	route(&Method::GET, path, query, state).await
}

async fn body_json(resp: hyper::Response<HttpBody>) -> Value {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn manual_delta_parsing() {
	assert_eq!(parse_manual_delta(Some("delta=5")), Ok(5));
	assert_eq!(parse_manual_delta(Some("minusdelta=3")), Ok(-3));
	assert_eq!(parse_manual_delta(Some("delta=0")), Ok(0));
	assert_eq!(parse_manual_delta(Some("delta=2&minusdelta=9")), Ok(2));
	assert_eq!(parse_manual_delta(None), Err(ManualDeltaError::Missing));
	assert_eq!(parse_manual_delta(Some("other=1")), Err(ManualDeltaError::Missing));
	assert_eq!(parse_manual_delta(Some("delta=-1")), Err(ManualDeltaError::NegativeDelta));
	assert_eq!(
		parse_manual_delta(Some("minusdelta=-1")),
		Err(ManualDeltaError::NegativeMinusDelta)
	);
	assert_eq!(parse_manual_delta(Some("delta=abc")), Err(ManualDeltaError::NotANumber));
	assert_eq!(parse_manual_delta(Some("delta=")), Err(ManualDeltaError::NotANumber));
}

#[tokio::test]
async fn state_and_pause_controls() {
	let st = state(120);

	let resp = get(&st, "/state", None).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers()["access-control-allow-origin"], "*");
	assert_eq!(body_json(resp).await, json!({"remaining": 120, "paused": false}));

	assert_eq!(
		body_json(get(&st, "/pause", None).await).await,
		json!({"remaining": 120, "paused": true})
	);
	assert_eq!(body_json(get(&st, "/toggle", None).await).await["paused"], false);
	assert_eq!(body_json(get(&st, "/toggle", None).await).await["paused"], true);
	assert_eq!(body_json(get(&st, "/resume", None).await).await["paused"], false);
}

#[tokio::test]
async fn time_endpoint_adjusts_and_clamps() {
	let st = state(300);

	let resp = get(&st, "/time", Some("delta=2")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_json(resp).await["remaining"], 420);

	let resp = get(&st, "/time", Some("minusdelta=999999")).await;
	assert_eq!(body_json(resp).await["remaining"], 0);

	let resp = get(&st, "/time", Some("delta=-4")).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert!(body_json(resp).await["error"].is_string());

	assert_eq!(get(&st, "/time", None).await.status(), StatusCode::BAD_REQUEST);
	assert_eq!(st.accumulator.read_state().remaining_seconds, 0);
}

#[tokio::test]
async fn rewards_listing() {
	let st = state(0);

	let listing = body_json(get(&st, "/rewards", None).await).await;
	assert_eq!(
		listing,
		json!([
			{"name": "T 1 Sub", "minutes": 5},
			{"name": "T 2 Sub", "minutes": 10},
			{"name": "T 3 Sub", "minutes": 25},
			{"name": "100 Bits", "minutes": 1},
			{"name": "1 € Donation", "minutes": 1.5},
			{"name": "Kick Sub", "minutes": 5},
			{"name": "100 Kicks", "minutes": 1},
		])
	);

	assert_eq!(get(&st, "/rewards", Some("streamer=1")).await.status(), StatusCode::OK);
	let resp = get(&st, "/rewards", Some("streamer=2")).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_json(resp).await, json!({"error": "streamer not available"}));
}

#[tokio::test]
async fn health_and_readiness_endpoints() {
	let st = state(0);
	assert_eq!(get(&st, "/healthz", None).await.status(), StatusCode::OK);
	assert_eq!(get(&st, "/readyz", None).await.status(), StatusCode::SERVICE_UNAVAILABLE);
	st.health.mark_ready();
	let resp = get(&st, "/readyz", None).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_json(resp).await["ready"], true);
}

#[tokio::test]
async fn unknown_paths_and_methods() {
	let st = state(0);
	assert_eq!(get(&st, "/nope", None).await.status(), StatusCode::NOT_FOUND);
	assert_eq!(
		route(&Method::POST, "/pause", None, &st).await.status(),
		StatusCode::METHOD_NOT_ALLOWED
	);
	assert!(!st.accumulator.read_state().paused);

	let preflight = route(&Method::OPTIONS, "/state", None, &st).await;
	assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
	assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn events_stream_sends_current_state_then_updates() {
	let st = state(60);
	let resp = get(&st, "/events", None).await;
	assert_eq!(resp.headers()["content-type"], "text/event-stream");
	let mut body = resp.into_body();

	let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
	assert_eq!(
		std::str::from_utf8(&first).unwrap(),
		"event: timer_update\ndata: {\"remaining\":60,\"paused\":false}\n\n"
	);

	st.accumulator.pause().await;
	let second = body.frame().await.unwrap().unwrap().into_data().unwrap();
	assert!(std::str::from_utf8(&second).unwrap().contains("\"paused\":true"));
}
