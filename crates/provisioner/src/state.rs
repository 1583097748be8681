//! Execution record persistence.
//!
//! The state store is the single source of truth for stage status. Records
//! survive process restarts so an interrupted install can resume, and every
//! write reaches disk before the caller is told it succeeded.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Status of one stage on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet executed (or blocked).
    Pending,
    /// Action in flight.
    Running,
    /// Action completed successfully.
    Succeeded,
    /// Action failed after the retry budget.
    Failed,
    /// A prior success was re-confirmed without running the action.
    Skipped,
    /// Found `running` after a restart; the outcome was never recorded.
    Unknown,
}

impl StageStatus {
    /// Whether dependents may run on top of this status.
    #[must_use]
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of a (target, stage) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Target name.
    pub target: String,
    /// Stage id.
    pub stage: String,
    /// Current status.
    pub status: StageStatus,
    /// Attempts made in the latest execution.
    pub attempts: u32,
    /// Exit code or failure class of the last attempt.
    #[serde(default)]
    pub last_signal: Option<String>,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
    /// Captured output of the last attempt.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Idempotency key of the last successful execution.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Last error message.
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// A fresh `pending` record.
    #[must_use]
    pub fn pending(target: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            stage: stage.into(),
            status: StageStatus::Pending,
            attempts: 0,
            last_signal: None,
            updated_at: Utc::now(),
            output: None,
            idempotency_key: None,
            error: None,
        }
    }

    /// Copy of this record moved to `status`, timestamped now.
    #[must_use]
    pub fn transition(&self, status: StageStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// On-disk layout of one target's records.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TargetFile {
    records: BTreeMap<String, ExecutionRecord>,
}

/// File-backed store of execution records, one file per target.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    targets: Mutex<HashMap<String, BTreeMap<String, ExecutionRecord>>>,
}

impl StateStore {
    /// Open (or create) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("records")).map_err(|source| Error::State {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            targets: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record for a (target, stage) pair, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the target's state file cannot be loaded.
    pub fn get(&self, target: &str, stage: &str) -> Result<Option<ExecutionRecord>> {
        let mut targets = self.lock();
        let records = self.loaded(&mut targets, target)?;
        Ok(records.get(stage).cloned())
    }

    /// Store a record durably.
    ///
    /// The in-memory view changes only after the file has been written and
    /// synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn put(&self, target: &str, stage: &str, record: ExecutionRecord) -> Result<()> {
        let mut targets = self.lock();
        let mut records = self.loaded(&mut targets, target)?.clone();
        debug!(target = %target, stage = %stage, status = %record.status, "Persisting record");
        records.insert(stage.to_string(), record);
        self.persist(target, &records)?;
        targets.insert(target.to_string(), records);
        Ok(())
    }

    /// Delete a record durably.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn remove(&self, target: &str, stage: &str) -> Result<()> {
        let mut targets = self.lock();
        let mut records = self.loaded(&mut targets, target)?.clone();
        if records.remove(stage).is_some() {
            self.persist(target, &records)?;
            targets.insert(target.to_string(), records);
        }
        Ok(())
    }

    /// Status of every recorded stage of a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the target's state file cannot be loaded.
    pub fn snapshot(&self, target: &str) -> Result<BTreeMap<String, StageStatus>> {
        Ok(self
            .records(target)?
            .into_iter()
            .map(|(stage, record)| (stage, record.status))
            .collect())
    }

    /// Every record of a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the target's state file cannot be loaded.
    pub fn records(&self, target: &str) -> Result<BTreeMap<String, ExecutionRecord>> {
        let mut targets = self.lock();
        Ok(self.loaded(&mut targets, target)?.clone())
    }

    /// Path of the captured output for one attempt.
    #[must_use]
    pub fn log_path(&self, target: &str, stage: &str, attempt: u32) -> PathBuf {
        self.dir
            .join("logs")
            .join(file_component(target))
            .join(format!("{}.{attempt}.log", file_component(stage)))
    }

    /// Write captured output for one attempt and return its path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if the log cannot be written.
    pub fn write_log(&self, target: &str, stage: &str, attempt: u32, output: &str) -> Result<PathBuf> {
        let path = self.log_path(target, stage, attempt);
        let state_err = |source| Error::State {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(state_err)?;
        }
        std::fs::write(&path, output).map_err(state_err)?;
        Ok(path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, ExecutionRecord>>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn target_file(&self, target: &str) -> PathBuf {
        self.dir
            .join("records")
            .join(format!("{}.json", file_component(target)))
    }

    /// Records for `target`, loading them from disk on first access.
    fn loaded<'a>(
        &self,
        targets: &'a mut HashMap<String, BTreeMap<String, ExecutionRecord>>,
        target: &str,
    ) -> Result<&'a BTreeMap<String, ExecutionRecord>> {
        if !targets.contains_key(target) {
            let records = self.load(target)?;
            targets.insert(target.to_string(), records);
        }
        targets
            .get(target)
            .ok_or_else(|| Error::Config(format!("State for {target} vanished")))
    }

    fn load(&self, target: &str) -> Result<BTreeMap<String, ExecutionRecord>> {
        let path = self.target_file(target);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(Error::State { path, source }),
        };

        let file: TargetFile = serde_json::from_str(&content).map_err(|e| Error::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut records = file.records;
        for record in records.values_mut() {
            if record.status == StageStatus::Running {
                warn!(
                    target = %target,
                    stage = %record.stage,
                    "Stage was running when the last run stopped; outcome unknown"
                );
                record.status = StageStatus::Unknown;
            }
        }

        info!(target = %target, records = records.len(), "Loaded execution records");
        Ok(records)
    }

    /// Write the target file atomically: temp file, fsync, rename.
    fn persist(&self, target: &str, records: &BTreeMap<String, ExecutionRecord>) -> Result<()> {
        let path = self.target_file(target);
        let tmp = path.with_extension("json.tmp");
        let state_err = |source| Error::State {
            path: path.clone(),
            source,
        };

        let file = TargetFile {
            records: records.clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|e| Error::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut handle = std::fs::File::create(&tmp).map_err(state_err)?;
        handle.write_all(content.as_bytes()).map_err(state_err)?;
        handle.sync_all().map_err(state_err)?;
        drop(handle);
        std::fs::rename(&tmp, &path).map_err(state_err)?;

        // Make the rename itself durable where the platform allows it.
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// Encode a name as a single path component. Distinct names map to
/// distinct components.
fn file_component(name: &str) -> String {
    use std::fmt::Write as _;

    let dots_only = !name.is_empty() && name.bytes().all(|b| b == b'.');
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        let plain = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') || (byte == b'.' && !dots_only);
        if plain {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        assert!(store.get("node", "k3s").unwrap().is_none());

        let record = ExecutionRecord::pending("node", "k3s");
        store.put("node", "k3s", record.transition(StageStatus::Succeeded)).unwrap();
        store.put("node", "flux", ExecutionRecord::pending("node", "flux")).unwrap();

        let snapshot = store.snapshot("node").unwrap();
        assert_eq!(snapshot.get("k3s"), Some(&StageStatus::Succeeded));
        assert_eq!(snapshot.get("flux"), Some(&StageStatus::Pending));
        assert!(store.snapshot("other").unwrap().is_empty());
    }

    #[test]
    fn test_similar_target_names_do_not_share_a_file() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .put("gpu node", "k3s", ExecutionRecord::pending("gpu node", "k3s").transition(StageStatus::Succeeded))
            .unwrap();
        store
            .put("gpu_node", "k3s", ExecutionRecord::pending("gpu_node", "k3s"))
            .unwrap();

        let reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(reopened.snapshot("gpu node").unwrap()["k3s"], StageStatus::Succeeded);
        assert_eq!(reopened.snapshot("gpu_node").unwrap()["k3s"], StageStatus::Pending);
        assert_ne!(file_component(".."), "..");
        assert_eq!(file_component("gpu-node.lan"), "gpu-node.lan");
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            let mut record = ExecutionRecord::pending("node", "k3s").transition(StageStatus::Succeeded);
            record.idempotency_key = Some("abc".into());
            record.attempts = 2;
            store.put("node", "k3s", record).unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        let record = store.get("node", "k3s").unwrap().unwrap();
        assert_eq!(record.status, StageStatus::Succeeded);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.idempotency_key.as_deref(), Some("abc"));
    }

    #[test]
    fn test_running_record_loads_as_unknown() {
        let dir = TempDir::new().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            let record = ExecutionRecord::pending("node", "flux").transition(StageStatus::Running);
            store.put("node", "flux", record).unwrap();
            // Same process still sees its own write.
            assert_eq!(store.snapshot("node").unwrap()["flux"], StageStatus::Running);
        }

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.snapshot("node").unwrap()["flux"], StageStatus::Unknown);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.put("node", "k3s", ExecutionRecord::pending("node", "k3s")).unwrap();
        store.remove("node", "k3s").unwrap();
        store.remove("node", "never-there").unwrap();
        assert!(store.get("node", "k3s").unwrap().is_none());

        let reopened = StateStore::open(dir.path()).unwrap();
        assert!(reopened.get("node", "k3s").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("records/node.json"), "{not json").unwrap();
        assert!(matches!(
            store.snapshot("node"),
            Err(Error::CorruptState { .. })
        ));
    }

    #[test]
    fn test_log_paths() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let path = store.write_log("gpu/node", "k3s", 2, "hello").unwrap();
        assert_eq!(path, dir.path().join("logs/gpu%2Fnode/k3s.2.log"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello");
    }
}
