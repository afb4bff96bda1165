#![forbid(unsafe_code)]

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use parking_lot::Mutex;
use subathon_domain::TimerSnapshot;
use tracing::{info, warn};

/// Durable `{remaining, paused}` storage.
pub trait SnapshotStore: Send + Sync + 'static {
	/// `Ok(None)` when nothing has been stored yet.
	fn load(&self) -> anyhow::Result<Option<TimerSnapshot>>;

	fn save(&self, snapshot: &TimerSnapshot) -> anyhow::Result<()>;
}

/// JSON file store, written through a temp file and rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
	path: PathBuf,
}

impl JsonFileStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn temp_path(&self) -> PathBuf {
		let mut name = self
			.path
			.file_name()
			.map(|n| n.to_os_string())
			.unwrap_or_else(|| "state.json".into());
		name.push(".tmp");
		self.path.with_file_name(name)
	}
}

impl SnapshotStore for JsonFileStore {
	fn load(&self) -> anyhow::Result<Option<TimerSnapshot>> {
		match fs::read_to_string(&self.path) {
			Ok(s) => {
				let snap: TimerSnapshot = serde_json::from_str(&s).context("parse state file")?;
				Ok(Some(snap))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(anyhow!(e).context("read state file")),
		}
	}

	fn save(&self, snapshot: &TimerSnapshot) -> anyhow::Result<()> {
		let body = serde_json::to_vec(snapshot).context("encode state")?;
		let tmp = self.temp_path();
		{
			let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
			f.write_all(&body).context("write state")?;
			f.sync_all().context("sync state")?;
		}
		fs::rename(&tmp, &self.path).with_context(|| format!("rename state into {}", self.path.display()))?;
		Ok(())
	}
}

/// Volatile store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<InMemoryInner>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct InMemoryInner {
	snapshot: Option<TimerSnapshot>,
	saves: usize,
	fail_saves: bool,
}

#[cfg(test)]
impl InMemoryStore {
	pub fn with_snapshot(snapshot: TimerSnapshot) -> Self {
		Self {
			inner: Mutex::new(InMemoryInner {
				snapshot: Some(snapshot),
				..InMemoryInner::default()
			}),
		}
	}

	pub fn snapshot(&self) -> Option<TimerSnapshot> {
		self.inner.lock().snapshot
	}

	pub fn saves(&self) -> usize {
		self.inner.lock().saves
	}

	/// Make subsequent saves fail.
	pub fn set_failing(&self, failing: bool) {
		self.inner.lock().fail_saves = failing;
	}
}

#[cfg(test)]
impl SnapshotStore for InMemoryStore {
	fn load(&self) -> anyhow::Result<Option<TimerSnapshot>> {
		Ok(self.inner.lock().snapshot)
	}

	fn save(&self, snapshot: &TimerSnapshot) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		if inner.fail_saves {
			return Err(anyhow!("in-memory store set to fail"));
		}
		inner.snapshot = Some(*snapshot);
		inner.saves += 1;
		Ok(())
	}
}

/// Seed state from the store, falling back to `start_minutes`.
pub fn load_initial(store: &dyn SnapshotStore, start_minutes: u64) -> TimerSnapshot {
	let fallback = TimerSnapshot::new(start_minutes.saturating_mul(60), false);
	match store.load() {
		Ok(Some(snap)) => {
			info!(
				remaining_minutes = snap.remaining_seconds / 60,
				paused = snap.paused,
				"restored timer state"
			);
			snap
		}
		Ok(None) => {
			info!(start_minutes, "no saved timer state; starting fresh");
			fallback
		}
		Err(e) => {
			warn!(error = %e, start_minutes, "could not load timer state; starting fresh");
			fallback
		}
	}
}

/// Ordered snapshot writes. A write older than the last persisted one is
/// skipped, so a late coalesced tick can't clobber a newer credit.
///
/// `write` blocks on file I/O; async callers go through `spawn_blocking`.
pub struct SnapshotWriter {
	store: std::sync::Arc<dyn SnapshotStore>,
	last_seq: Mutex<Option<u64>>,
}

impl SnapshotWriter {
	pub fn new(store: std::sync::Arc<dyn SnapshotStore>) -> Self {
		Self {
			store,
			last_seq: Mutex::new(None),
		}
	}

	/// Returns whether the snapshot was persisted. Writes are serialized so
	/// the sequence check and the save happen as one step.
	pub fn write(&self, seq: u64, snapshot: &TimerSnapshot) -> bool {
		let mut last = self.last_seq.lock();
		if last.is_some_and(|l| seq <= l) {
			return false;
		}
		match self.store.save(snapshot) {
			Ok(()) => {
				*last = Some(seq);
				true
			}
			Err(e) => {
				metrics::counter!("subathon_snapshot_write_errors_total").increment(1);
				warn!(error = %e, seq, "snapshot write failed; keeping in-memory state");
				false
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	fn temp_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("subathon-{name}-{}", std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[test]
	fn json_store_round_trips_legacy_shape() {
		let dir = temp_dir("json-store");
		let store = JsonFileStore::new(dir.join("state.json"));
		assert_eq!(store.load().unwrap(), None);

		store.save(&TimerSnapshot::new(4200, true)).unwrap();
		let raw = fs::read_to_string(store.path()).unwrap();
		assert_eq!(raw, r#"{"remaining":4200,"paused":true}"#);
		assert_eq!(store.load().unwrap(), Some(TimerSnapshot::new(4200, true)));
		assert!(!store.temp_path().exists());
	}

	#[test]
	fn corrupt_file_falls_back_to_start_minutes() {
		let dir = temp_dir("corrupt");
		let path = dir.join("state.json");
		fs::write(&path, "{not json").unwrap();
		let store = JsonFileStore::new(&path);
		assert!(store.load().is_err());
		assert_eq!(load_initial(&store, 60), TimerSnapshot::new(3600, false));
	}

	#[test]
	fn load_initial_prefers_stored_state() {
		let store = InMemoryStore::with_snapshot(TimerSnapshot::new(10, true));
		assert_eq!(load_initial(&store, 60), TimerSnapshot::new(10, true));
		assert_eq!(load_initial(&InMemoryStore::default(), 2), TimerSnapshot::new(120, false));
	}

	#[test]
	fn writer_skips_stale_sequence_numbers() {
		let store = Arc::new(InMemoryStore::default());
		let writer = SnapshotWriter::new(store.clone());

		assert!(writer.write(5, &TimerSnapshot::new(500, false)));
		assert!(!writer.write(3, &TimerSnapshot::new(300, false)));
		assert_eq!(store.snapshot(), Some(TimerSnapshot::new(500, false)));
		assert!(writer.write(6, &TimerSnapshot::new(499, false)));
		assert_eq!(store.saves(), 2);
	}

	#[test]
	fn failed_write_does_not_advance_sequence() {
		let store = Arc::new(InMemoryStore::default());
		let writer = SnapshotWriter::new(store.clone());

		store.set_failing(true);
		assert!(!writer.write(1, &TimerSnapshot::new(100, false)));
		store.set_failing(false);
		assert!(writer.write(1, &TimerSnapshot::new(100, false)));
	}
}
