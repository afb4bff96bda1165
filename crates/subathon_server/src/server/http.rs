#![forbid(unsafe_code)]

//! HTTP control surface: state, pause/resume, manual time changes, the
//! rewards listing, health checks and the SSE timer stream.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use subathon_domain::{RewardRates, StreamerId};
use tokio::net::TcpListener;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::server::accumulator::TimerAccumulator;
use crate::server::broadcaster::sse_frame;
use crate::server::health::HealthState;

pub type HttpBody = UnsyncBoxBody<Bytes, Infallible>;

const DEFAULT_REWARDS_STREAMER: &str = "1";
const BANNER: &str = "Subathon timer running!";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManualDeltaError {
	#[error("delta or minusdelta is missing")]
	Missing,
	#[error("delta must not be negative, use minusdelta")]
	NegativeDelta,
	#[error("minusdelta must not be negative")]
	NegativeMinusDelta,
	#[error("delta/minusdelta must be a number")]
	NotANumber,
}

/// Signed minutes from `delta=<n>` or `minusdelta=<n>`. `delta` wins when
/// both are present.
pub fn parse_manual_delta(query: Option<&str>) -> Result<i64, ManualDeltaError> {
	let mut delta = None;
	let mut minus = None;
	for (k, v) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
		match k.as_ref() {
			"delta" if delta.is_none() => delta = Some(v.into_owned()),
			"minusdelta" if minus.is_none() => minus = Some(v.into_owned()),
			_ => {}
		}
	}

	if let Some(raw) = delta {
		let n: i64 = raw.trim().parse().map_err(|_| ManualDeltaError::NotANumber)?;
		if n < 0 {
			return Err(ManualDeltaError::NegativeDelta);
		}
		return Ok(n);
	}
	if let Some(raw) = minus {
		let n: i64 = raw.trim().parse().map_err(|_| ManualDeltaError::NotANumber)?;
		if n < 0 {
			return Err(ManualDeltaError::NegativeMinusDelta);
		}
		return Ok(-n);
	}
	Err(ManualDeltaError::Missing)
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
	url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
}

#[derive(Clone)]
pub struct HttpState {
	pub accumulator: Arc<TimerAccumulator>,
	pub rewards: Arc<BTreeMap<StreamerId, Arc<RewardRates>>>,
	pub health: HealthState,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
}

fn with_cors(mut resp: Response<HttpBody>) -> Response<HttpBody> {
	resp.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
	resp
}

fn full(body: impl Into<Bytes>) -> HttpBody {
	Full::new(body.into()).boxed_unsync()
}

fn text(status: StatusCode, body: &'static str) -> Response<HttpBody> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full(body))
		.unwrap()
}

fn empty(status: StatusCode) -> Response<HttpBody> {
	Response::builder().status(status).body(full(Bytes::new())).unwrap()
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<HttpBody> {
	match serde_json::to_vec(value) {
		Ok(body) => Response::builder()
			.status(status)
			.header(header::CONTENT_TYPE, "application/json")
			.body(full(body))
			.unwrap(),
		Err(e) => {
			warn!(error = %e, "response serialization failed");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

fn error(status: StatusCode, message: &str) -> Response<HttpBody> {
	json(status, &ErrorBody { error: message })
}

fn events_stream(state: &HttpState) -> Response<HttpBody> {
	// Subscribe before reading so nothing published in between is lost.
	let rx = state.accumulator.broadcaster().subscribe();
	let current = state.accumulator.read_state();
	debug!(observers = state.accumulator.broadcaster().observers(), "sse observer connected");

	let frames = tokio_stream::once(current)
		.chain(BroadcastStream::new(rx).filter_map(Result::ok))
		.map(|snap| Ok::<_, Infallible>(Frame::data(Bytes::from(sse_frame(&snap)))));

	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.body(StreamBody::new(frames).boxed_unsync())
		.unwrap()
}

fn rewards(query: Option<&str>, state: &HttpState) -> Response<HttpBody> {
	let requested = query_param(query, "streamer").unwrap_or_else(|| DEFAULT_REWARDS_STREAMER.to_string());
	let rates = StreamerId::new(requested.trim())
		.ok()
		.and_then(|id| state.rewards.get(&id));
	match rates {
		Some(rates) => json(StatusCode::OK, &rates.entries()),
		None => error(StatusCode::BAD_REQUEST, "streamer not available"),
	}
}

/// Route one request. CORS is applied to every response.
pub async fn route(method: &Method, path: &str, query: Option<&str>, state: &HttpState) -> Response<HttpBody> {
	if method == Method::OPTIONS {
		let mut resp = empty(StatusCode::NO_CONTENT);
		let headers = resp.headers_mut();
		headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
		headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
		return with_cors(resp);
	}
	if method != Method::GET {
		return with_cors(empty(StatusCode::METHOD_NOT_ALLOWED));
	}

	let acc = &state.accumulator;
	let resp = match path {
		"/" => text(StatusCode::OK, BANNER),
		"/state" => json(StatusCode::OK, &acc.read_state()),
		"/pause" => json(StatusCode::OK, &acc.pause().await),
		"/resume" => json(StatusCode::OK, &acc.resume().await),
		"/toggle" => json(StatusCode::OK, &acc.toggle().await),
		"/time" => match parse_manual_delta(query) {
			Ok(minutes) => json(StatusCode::OK, &acc.apply_manual_delta(minutes).await),
			Err(e) => error(StatusCode::BAD_REQUEST, &e.to_string()),
		},
		"/rewards" => rewards(query, state),
		"/events" => events_stream(state),
		"/healthz" => text(StatusCode::OK, "ok"),
		"/readyz" => {
			let report = state.health.report();
			let status = if report.ready {
				StatusCode::OK
			} else {
				StatusCode::SERVICE_UNAVAILABLE
			};
			json(status, &report)
		}
		_ => empty(StatusCode::NOT_FOUND),
	};
	with_cors(resp)
}

async fn handle(req: Request<Incoming>, state: HttpState) -> Result<Response<HttpBody>, Infallible> {
	let resp = route(req.method(), req.uri().path(), req.uri().query(), &state).await;
	debug!(method = %req.method(), path = req.uri().path(), status = resp.status().as_u16(), "http request");
	metrics::counter!("subathon_http_requests_total", "status" => resp.status().as_u16().to_string()).increment(1);
	Ok(resp)
}

/// Accept loop; one task per connection.
pub async fn serve(listener: TcpListener, state: HttpState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "http connection error");
			}
		});
	}
}
