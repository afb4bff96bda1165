#![forbid(unsafe_code)]

//! Append-only raw event log. Recording never blocks ingestion: entries go
//! through a bounded queue to a background writer and are dropped when it
//! is full.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Local};
use subathon_platform::RawPayload;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_EVENT_LOG_QUEUE: usize = 1_024;

#[derive(Debug, Clone, Default)]
pub struct EventLogConfig {
	/// Text log (`events.log`).
	pub path: Option<PathBuf>,

	/// `sqlite:` or `postgres:` URL.
	pub database_url: Option<String>,

	pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
	pub at: DateTime<Local>,
	pub source: String,
	pub platform: String,
	pub streamer: String,
	pub payload: String,
}

impl LogEntry {
	pub fn from_payload(payload: &RawPayload) -> Self {
		Self {
			at: DateTime::<Local>::from(payload.received_at),
			source: payload.source.to_string(),
			platform: payload.platform.to_string(),
			streamer: payload.streamer.to_string(),
			payload: payload.body.to_log_json().to_string(),
		}
	}

	/// `[YYYY-mm-dd HH:MM:SS] [source] RAW EVENT: <json>`
	pub fn format_line(&self) -> String {
		format!(
			"[{}] [{}] RAW EVENT: {}\n",
			self.at.format("%Y-%m-%d %H:%M:%S"),
			self.source,
			self.payload
		)
	}
}

#[derive(Clone)]
enum SqlSink {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlSink {
	async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let sink = if database_url.starts_with("sqlite:") {
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(1)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			SqlSink::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			SqlSink::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url for event log"));
		};
		sink.migrate().await?;
		Ok(sink)
	}

	async fn migrate(&self) -> anyhow::Result<()> {
		match self {
			SqlSink::Sqlite(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS raw_events (\
					id INTEGER PRIMARY KEY AUTOINCREMENT, \
					received_at TEXT NOT NULL, \
					source TEXT NOT NULL, \
					platform TEXT NOT NULL, \
					streamer TEXT NOT NULL, \
					payload TEXT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create raw_events (sqlite)")?;
			}
			SqlSink::Postgres(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS raw_events (\
					id BIGSERIAL PRIMARY KEY, \
					received_at TEXT NOT NULL, \
					source TEXT NOT NULL, \
					platform TEXT NOT NULL, \
					streamer TEXT NOT NULL, \
					payload TEXT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create raw_events (postgres)")?;
			}
		}
		Ok(())
	}

	async fn insert(&self, entry: &LogEntry) -> anyhow::Result<()> {
		let at = entry.at.to_rfc3339();
		match self {
			SqlSink::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO raw_events (received_at, source, platform, streamer, payload) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(at)
				.bind(&entry.source)
				.bind(&entry.platform)
				.bind(&entry.streamer)
				.bind(&entry.payload)
				.execute(pool)
				.await
				.context("insert raw_events (sqlite)")?;
			}
			SqlSink::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO raw_events (received_at, source, platform, streamer, payload) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(at)
				.bind(&entry.source)
				.bind(&entry.platform)
				.bind(&entry.streamer)
				.bind(&entry.payload)
				.execute(pool)
				.await
				.context("insert raw_events (postgres)")?;
			}
		}
		Ok(())
	}
}

/// Handle for recording raw payloads.
#[derive(Clone)]
pub struct EventLog {
	tx: Option<mpsc::Sender<LogEntry>>,
}

impl EventLog {
	/// Connect the configured sinks and start the writer task.
	pub async fn start(cfg: EventLogConfig) -> anyhow::Result<(Self, Option<JoinHandle<()>>)> {
		let sql = match cfg.database_url.as_deref() {
			Some(url) => Some(SqlSink::connect(url).await?),
			None => None,
		};
		if cfg.path.is_none() && sql.is_none() {
			return Ok((Self::disabled(), None));
		}

		let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
		let handle = tokio::spawn(run_writer(rx, cfg.path, sql));
		Ok((Self { tx: Some(tx) }, Some(handle)))
	}

	pub fn disabled() -> Self {
		Self { tx: None }
	}

	/// Queue one payload. Returns `false` if it was dropped.
	pub fn record(&self, payload: &RawPayload) -> bool {
		let Some(tx) = &self.tx else {
			return true;
		};
		match tx.try_send(LogEntry::from_payload(payload)) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(entry)) => {
				metrics::counter!("subathon_event_log_dropped_total").increment(1);
				warn!(source = %entry.source, "event log queue full; dropping raw event");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				metrics::counter!("subathon_event_log_dropped_total").increment(1);
				false
			}
		}
	}
}

async fn run_writer(mut rx: mpsc::Receiver<LogEntry>, path: Option<PathBuf>, sql: Option<SqlSink>) {
	let mut file = path.map(FileSink::new);
	while let Some(entry) = rx.recv().await {
		if let Some(file) = &mut file
			&& let Err(e) = file.append(&entry).await
		{
			metrics::counter!("subathon_event_log_errors_total", "sink" => "file").increment(1);
			warn!(error = %e, path = %file.path.display(), "event log write failed");
		}
		if let Some(sql) = &sql
			&& let Err(e) = sql.insert(&entry).await
		{
			metrics::counter!("subathon_event_log_errors_total", "sink" => "sql").increment(1);
			warn!(error = %e, "event log insert failed");
		}
	}
	debug!("event log writer exiting");
}

/// Text log held open between entries. A failed write drops the handle so
/// the next entry reopens the file.
struct FileSink {
	path: PathBuf,
	file: Option<File>,
}

impl FileSink {
	fn new(path: PathBuf) -> Self {
		Self { path, file: None }
	}

	async fn append(&mut self, entry: &LogEntry) -> anyhow::Result<()> {
		let mut f = match self.file.take() {
			Some(f) => f,
			None => open_append(&self.path).await?,
		};
		f.write_all(entry.format_line().as_bytes())
			.await
			.context("append event log")?;
		f.flush().await.context("flush event log")?;
		self.file = Some(f);
		Ok(())
	}
}

async fn open_append(path: &Path) -> anyhow::Result<File> {
	OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.await
		.with_context(|| format!("open event log {}", path.display()))
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, UNIX_EPOCH};

	use chrono::TimeZone;
	use serde_json::json;
	use subathon_domain::{Platform, SourceId, StreamerId};
	use subathon_platform::{ConnectorIdentity, RawBody};

	use super::*;

	fn payload(body: RawBody) -> RawPayload {
		let identity = ConnectorIdentity::new(
			SourceId::new("SE-Twitch1").unwrap(),
			Platform::Twitch,
			StreamerId::new("1").unwrap(),
		);
		let mut p = RawPayload::new(&identity, "s", body);
		p.received_at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
		p
	}

	#[test]
	fn formats_log_line() {
		let mut entry = LogEntry::from_payload(&payload(RawBody::Activity(json!({"type": "cheer"}))));
		entry.at = Local.with_ymd_and_hms(2024, 3, 9, 18, 5, 7).unwrap();
		assert_eq!(
			entry.format_line(),
			"[2024-03-09 18:05:07] [SE-Twitch1] RAW EVENT: {\"type\":\"cheer\"}\n"
		);
	}

	#[test]
	fn chat_payloads_log_as_json() {
		let entry = LogEntry::from_payload(&payload(RawBody::Chat {
			text: "gifted 100 KICKs".to_string(),
			sender: Some("bob".to_string()),
		}));
		let v: serde_json::Value = serde_json::from_str(&entry.payload).unwrap();
		assert_eq!(v["content"], "gifted 100 KICKs");
	}

	#[test]
	fn disabled_log_accepts_everything() {
		assert!(EventLog::disabled().record(&payload(RawBody::Activity(json!({})))));
	}

	#[tokio::test]
	async fn full_queue_drops_instead_of_blocking() {
		let (tx, _rx) = mpsc::channel(1);
		let log = EventLog { tx: Some(tx) };
		let p = payload(RawBody::Activity(json!({"type": "tip"})));
		assert!(log.record(&p));
		assert!(!log.record(&p));
	}

	#[tokio::test]
	async fn writes_file_and_sqlite_sinks() {
		let dir = std::env::temp_dir().join(format!("subathon-event-log-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("events.log");

		let sql = SqlSink::connect("sqlite::memory:").await.unwrap();
		let (tx, rx) = mpsc::channel(8);
		let writer = tokio::spawn(run_writer(rx, Some(path.clone()), Some(sql.clone())));
		let log = EventLog { tx: Some(tx) };

		log.record(&payload(RawBody::Activity(json!({"type": "cheer", "data": {"amount": 100}}))));
		log.record(&payload(RawBody::Activity(json!({"type": "tip", "data": {"amount": 5}}))));
		drop(log);
		writer.await.unwrap();

		let text = std::fs::read_to_string(&path).unwrap();
		assert_eq!(text.lines().count(), 2);
		assert!(text.lines().all(|l| l.contains("[SE-Twitch1] RAW EVENT: ")));

		let SqlSink::Sqlite(pool) = &sql else {
			panic!("expected sqlite sink");
		};
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_events")
			.fetch_one(pool)
			.await
			.unwrap();
		assert_eq!(count, 2);
	}

	#[tokio::test]
	async fn file_sink_reopens_after_a_failed_write() {
		let dir = std::env::temp_dir().join(format!("subathon-event-log-reopen-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		let path = dir.join("events.log");
		let entry = LogEntry::from_payload(&payload(RawBody::Activity(json!({"type": "cheer"}))));

		let mut sink = FileSink::new(path.clone());
		assert!(sink.append(&entry).await.is_err());
		assert!(sink.file.is_none());

		std::fs::create_dir_all(&dir).unwrap();
		sink.append(&entry).await.unwrap();
		assert!(sink.file.is_some());
		assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn file_sink_keeps_its_handle_between_entries() {
		let dir = std::env::temp_dir().join(format!("subathon-event-log-handle-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("events.log");
		let rotated = dir.join("events.log.1");
		let entry = LogEntry::from_payload(&payload(RawBody::Activity(json!({"type": "tip"}))));

		let mut sink = FileSink::new(path.clone());
		sink.append(&entry).await.unwrap();
		std::fs::rename(&path, &rotated).unwrap();
		sink.append(&entry).await.unwrap();

		assert!(!path.exists());
		assert_eq!(std::fs::read_to_string(&rotated).unwrap().lines().count(), 2);
	}

	#[tokio::test]
	async fn rejects_unknown_database_scheme() {
		assert!(SqlSink::connect("mysql://localhost/db").await.is_err());
	}
}
