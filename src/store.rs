use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{FeedbackEntry, FirstSeen, IssueTrackEntry, Snapshot};

pub const HISTORY_VERSION: u32 = 1;
const HISTORY_FILE: &str = "history.json";

/// Everything the engine remembers between runs. Built fully in memory for
/// the next run and persisted with a single replacing write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryState {
    pub version: u32,
    /// Number of committed runs; the tracker uses it to detect gaps.
    #[serde(default)]
    pub run_seq: u64,
    #[serde(default)]
    pub last_run_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub previous_snapshot: Option<Snapshot>,
    #[serde(default)]
    pub issues: Vec<IssueTrackEntry>,
    #[serde(default)]
    pub feedback: Vec<FeedbackEntry>,
    #[serde(default)]
    pub graded_first_seen: BTreeMap<String, FirstSeen>,
}

impl Default for HistoryState {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            run_seq: 0,
            last_run_at: None,
            previous_snapshot: None,
            issues: Vec::new(),
            feedback: Vec::new(),
            graded_first_seen: BTreeMap::new(),
        }
    }
}

impl HistoryState {
    pub fn is_first_run(&self) -> bool {
        self.previous_snapshot.is_none()
    }
}

pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    /// Read the persisted state. A missing, unreadable or incompatible file
    /// yields an empty state so the run proceeds as a first run.
    pub fn load(&self) -> HistoryState {
        match self.try_load() {
            Ok(Some(state)) => {
                debug!(
                    run_seq = state.run_seq,
                    issues = state.issues.len(),
                    feedback = state.feedback.len(),
                    "loaded history"
                );
                state
            }
            Ok(None) => {
                info!(path = %self.path().display(), "no history found, treating as first run");
                HistoryState::default()
            }
            Err(err) => {
                warn!(path = %self.path().display(), error = %err, "history unusable, starting fresh");
                HistoryState::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<HistoryState>, StoreError> {
        let path = self.path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let state: HistoryState = serde_json::from_str(&raw)?;
        if state.version != HISTORY_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: state.version,
                expected: HISTORY_VERSION,
            });
        }
        Ok(Some(state))
    }

    /// Replace the persisted state in one step: write a sibling temp file,
    /// flush it to disk, rename it over the live file, then sync the
    /// directory so the rename itself is durable. A failed commit leaves the
    /// previous file untouched and no temp file behind.
    pub fn commit(&self, state: &HistoryState) -> Result<(), StoreError> {
        let path = self.path();
        let temp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state)?;

        let written = File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(&body)?;
                file.sync_all()
            })
            .map_err(|e| StoreError::io(&temp_path, e))
            .and_then(|_| fs::rename(&temp_path, &path).map_err(|e| StoreError::io(&path, e)));
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temp history file");
                }
            }
            return Err(err);
        }

        self.sync_dir();
        info!(path = %path.display(), run_seq = state.run_seq, "history committed");
        Ok(())
    }

    fn sync_dir(&self) {
        // Directories cannot be opened for syncing on every platform.
        if let Err(err) = File::open(&self.dir).and_then(|dir| dir.sync_all()) {
            debug!(dir = %self.dir.display(), error = %err, "state directory not synced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use crate::models::{IssueKey, IssueKind};

    fn sample_state() -> HistoryState {
        let day = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        HistoryState {
            run_seq: 4,
            last_run_at: day.and_hms_opt(7, 0, 0),
            previous_snapshot: Some(Snapshot::new(day.and_hms_opt(6, 55, 0).unwrap())),
            issues: vec![IssueTrackEntry {
                key: IssueKey {
                    item: "math::a12".to_string(),
                    kind: IssueKind::Overdue,
                },
                label: "Worksheet 12".to_string(),
                first_observed: day,
                last_observed: day,
                last_seen_run: 4,
                consecutive_runs: 1,
            }],
            ..HistoryState::default()
        }
    }

    #[test]
    fn missing_history_is_first_run() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(temp.path()).unwrap();
        let state = store.load();
        assert!(state.is_first_run());
        assert_eq!(state.run_seq, 0);
    }

    #[test]
    fn commit_then_load_returns_same_state() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(temp.path()).unwrap();
        let state = sample_state();

        store.commit(&state).unwrap();
        assert_eq!(store.load(), state);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_history_is_treated_as_first_run() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(temp.path()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let state = store.load();
        assert!(state.is_first_run());
        assert!(state.issues.is_empty());
    }

    #[test]
    fn future_version_is_treated_as_first_run() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(temp.path()).unwrap();
        let mut state = sample_state();
        state.version = HISTORY_VERSION + 1;
        fs::write(store.path(), serde_json::to_string(&state).unwrap()).unwrap();

        assert!(store.load().is_first_run());
    }

    #[test]
    fn commit_into_missing_directory_is_surfaced() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(&temp.path().join("state")).unwrap();
        fs::remove_dir_all(temp.path().join("state")).unwrap();

        let err = store.commit(&sample_state()).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(temp.path()).unwrap();
        // a non-empty directory where the history file should be
        fs::create_dir(store.path()).unwrap();
        fs::write(store.path().join("keep"), "x").unwrap();

        let err = store.commit(&sample_state()).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(!store.path().with_extension("json.tmp").exists());
        assert!(store.path().join("keep").exists());
    }
}
