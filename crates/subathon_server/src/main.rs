#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use subathon_domain::{Platform, SourceId};
use subathon_platform::kick::{KickChatConfig, KickChatProtocol};
use subathon_platform::streamelements::{StreamElementsConfig, StreamElementsProtocol};
use subathon_platform::tipeee::{TipeeeConfig, TipeeeProtocol};
use subathon_platform::{ConnectorIdentity, WsConnector};
use subathon_util::endpoint::HttpEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{DEFAULT_BIND, DEFAULT_KICK_CLUSTER, ServerConfig};
use crate::server::accumulator::{AccumulatorConfig, TimerAccumulator, spawn_tick_loop};
use crate::server::broadcaster::StateBroadcaster;
use crate::server::correlation::CorrelationEngine;
use crate::server::event_log::EventLog;
use crate::server::health::HealthState;
use crate::server::http::{HttpState, serve};
use crate::server::pipeline::{ConnectorSpec, Pipeline, PipelineConfig, PipelineContext};
use crate::server::scheduler::GiftScheduler;
use crate::server::snapshot::{JsonFileStore, SnapshotWriter, load_initial};

const TICK_PERIOD: Duration = Duration::from_secs(1);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: subathon_server [--config path] [--bind http://host:port]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.subathon/config.toml)\n\
\t--bind    HTTP bind endpoint (default: {DEFAULT_BIND})\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	bind: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		bind: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if let Err(e) = HttpEndpoint::parse(&v) {
					eprintln!("{e}");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,subathon_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("subathon_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
	if let Some(parent) = path.parent()
		&& !parent.as_os_str().is_empty()
	{
		std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
	}
	Ok(())
}

/// One connector per configured credential of every active streamer.
fn build_connectors(cfg: &ServerConfig) -> anyhow::Result<Vec<ConnectorSpec>> {
	let mut out: Vec<ConnectorSpec> = Vec::new();

	for streamer in cfg.active_streamers() {
		let n = streamer.id.as_str();
		let identity = |source: String, platform: Platform| -> anyhow::Result<ConnectorIdentity> {
			Ok(ConnectorIdentity::new(
				SourceId::new(source)?,
				platform,
				streamer.id.clone(),
			))
		};
		let mut push = |connector: Box<dyn subathon_platform::Connector>| {
			out.push(ConnectorSpec {
				connector,
				rates: Arc::clone(&streamer.rewards),
			});
		};

		if let Some(token) = &streamer.streamelements_token {
			let protocol = StreamElementsProtocol::new(StreamElementsConfig::new(token.clone()));
			let id = identity(format!("SE-Twitch{n}"), Platform::Twitch)?;
			push(Box::new(WsConnector::new(id, protocol, cfg.reconnect)));
		}

		if let Some(token) = &streamer.streamelements_kick_token {
			let source = if streamer.is_primary() {
				"SE-Kick".to_string()
			} else {
				format!("SE-Kick{n}")
			};
			let protocol = StreamElementsProtocol::new(StreamElementsConfig::new(token.clone()));
			push(Box::new(WsConnector::new(
				identity(source, Platform::Kick)?,
				protocol,
				cfg.reconnect,
			)));
		}

		if let Some(tipeee) = &streamer.tipeee {
			let protocol = TipeeeProtocol::new(TipeeeConfig::new(tipeee.api_key.clone(), tipeee.username.clone()));
			let id = identity(format!("Tipeee-{n}"), Platform::Twitch)?;
			push(Box::new(WsConnector::new(id, protocol, cfg.reconnect)));
		}

		match &streamer.kick_chat {
			Some(kick) if kick.is_usable() => {
				let mut kick_cfg = KickChatConfig::new(
					kick.app_key.clone().unwrap_or_default(),
					kick.cluster.clone().unwrap_or_else(|| DEFAULT_KICK_CLUSTER.to_string()),
				);
				kick_cfg.chatroom_id = kick.chatroom_id;
				kick_cfg.channel_slug = kick.channel_slug.clone();
				let id = identity(format!("Kick-chat-{n}"), Platform::Kick)?;
				push(Box::new(WsConnector::new(id, KickChatProtocol::new(kick_cfg), cfg.reconnect)));
			}
			Some(_) => warn!(streamer = %streamer.id, "kick chat needs an app key and a chatroom id or slug; skipped"),
			None => {}
		}
	}

	Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind_addr = HttpEndpoint::parse(&cfg.server.bind)
		.and_then(|e| e.to_socket_addr_if_ip_literal())
		.map_err(|e| anyhow!(e))
		.context("server.bind")?;

	ensure_parent_dir(&cfg.server.state_path)?;
	if let Some(path) = &cfg.event_log.path {
		ensure_parent_dir(path)?;
	}

	let store = Arc::new(JsonFileStore::new(cfg.server.state_path.clone()));
	info!(path = %store.path().display(), "timer state file");
	let initial = load_initial(store.as_ref(), cfg.start_minutes);
	let writer = Arc::new(SnapshotWriter::new(store));
	let broadcaster = StateBroadcaster::new(cfg.server.broadcast_capacity);
	let accumulator = Arc::new(TimerAccumulator::new(
		initial,
		writer,
		broadcaster,
		AccumulatorConfig {
			tick_persist_every: cfg.server.tick_persist_every,
		},
	));
	let _tick_writer = accumulator.spawn_tick_writer();
	let _tick_loop = spawn_tick_loop(Arc::clone(&accumulator), TICK_PERIOD);

	let engine = Arc::new(CorrelationEngine::new(cfg.correlation));
	let (scheduler, _scheduler_task) = GiftScheduler::spawn(Arc::clone(&engine), Arc::clone(&accumulator));

	let (event_log, _event_log_task) = match EventLog::start(cfg.event_log.clone()).await {
		Ok(started) => started,
		Err(e) => {
			warn!(error = %e, "event log unavailable; raw events will not be recorded");
			(EventLog::disabled(), None)
		}
	};

	let health = HealthState::new();
	let connectors = build_connectors(&cfg)?;
	if connectors.is_empty() {
		warn!("no provider credentials configured; only manual time changes will apply");
	}

	let pipeline = Pipeline::start(
		connectors,
		PipelineContext {
			engine,
			scheduler,
			accumulator: Arc::clone(&accumulator),
			event_log,
			health: health.clone(),
		},
		PipelineConfig::default(),
	);
	for source in pipeline.sources() {
		info!(%source, "connector configured");
	}

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind http listener on {bind_addr}"))?;
	let http_state = HttpState {
		accumulator: Arc::clone(&accumulator),
		rewards: Arc::new(cfg.reward_table()),
		health: health.clone(),
	};
	health.mark_ready();
	info!(bind = %bind_addr, "subathon_server: http control surface ready");

	tokio::select! {
		res = serve(listener, http_state) => {
			if let Err(e) = res {
				warn!(error = %e, "http server stopped");
			}
		}
		res = tokio::signal::ctrl_c() => {
			if let Err(e) = res {
				warn!(error = %e, "ctrl-c handler failed");
			}
			info!("shutdown requested");
		}
	}

	pipeline.shutdown().await;
	let snap = accumulator.persist_now().await;
	info!(remaining_minutes = snap.remaining_seconds / 60, paused = snap.paused, "final timer state saved");

	Ok(())
}
