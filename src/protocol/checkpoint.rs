//! Checkpoint store
//!
//! Keeps the latest checkpoint of every run still in flight, in memory and
//! optionally as one `{run_id}.json` file per run. A run that reaches a
//! terminal state loses its file and moves to a bounded in-memory history of
//! finished runs. Sessions cannot be resumed after a restart, so runs found in
//! flight on open are only reported and can be failed with
//! `recover_interrupted`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::state::{FlowState, Role};
use super::ProtocolId;
use crate::registry::SignedKeyMapping;

/// Finished runs kept in memory unless configured otherwise.
pub const DEFAULT_FINISHED_HISTORY: usize = 32;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub session_id: Option<Uuid>,
    pub protocol: ProtocolId,
    pub role: Role,
    pub counterparty: String,
    pub state: FlowState,
    /// The mapping this run sent or accepted, once there is one.
    #[serde(default)]
    pub mapping: Option<SignedKeyMapping>,
    pub updated_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    runs: RwLock<HashMap<Uuid, Checkpoint>>,
    finished: RwLock<VecDeque<Checkpoint>>,
    history: usize,
    dir: Option<PathBuf>,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            finished: RwLock::new(VecDeque::new()),
            history: DEFAULT_FINISHED_HISTORY,
            dir: None,
        }
    }
}

impl CheckpointStore {
    /// An in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` finished runs in memory. Zero keeps none.
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    /// A store persisted under `dir`, loading whatever is already there.
    pub fn open(dir: &Path) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(dir).map_err(|e| CheckpointError::IoError(e.to_string()))?;

        let mut runs = HashMap::new();
        let entries = std::fs::read_dir(dir).map_err(|e| CheckpointError::IoError(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| CheckpointError::IoError(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path).map_err(|e| CheckpointError::IoError(e.to_string()))?;
            let checkpoint: Checkpoint = serde_json::from_slice(&data).map_err(|e| {
                CheckpointError::DeserializationError(format!("{}: {}", path.display(), e))
            })?;
            runs.insert(checkpoint.run_id, checkpoint);
        }

        Ok(Self {
            runs: RwLock::new(runs),
            dir: Some(dir.to_path_buf()),
            ..Self::default()
        })
    }

    /// Store the latest checkpoint of a run, replacing the previous one. A
    /// terminal checkpoint retires the run.
    pub fn record(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.state.is_terminal() {
            return self.retire(checkpoint);
        }
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = self.path_for(checkpoint.run_id) {
            let json = serde_json::to_string_pretty(checkpoint)
                .map_err(|e| CheckpointError::SerializationError(e.to_string()))?;
            std::fs::write(path, json).map_err(|e| CheckpointError::IoError(e.to_string()))?;
        }
        runs.insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }

    fn retire(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = self.path_for(checkpoint.run_id) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::IoError(e.to_string())),
            }
        }
        runs.remove(&checkpoint.run_id);

        let mut finished = self.finished.write().unwrap_or_else(PoisonError::into_inner);
        finished.retain(|c| c.run_id != checkpoint.run_id);
        if self.history > 0 {
            if finished.len() == self.history {
                finished.pop_front();
            }
            finished.push_back(checkpoint.clone());
        }
        Ok(())
    }

    fn path_for(&self, run_id: Uuid) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", run_id)))
    }

    pub fn get(&self, run_id: Uuid) -> Option<Checkpoint> {
        if let Some(checkpoint) = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
        {
            return Some(checkpoint.clone());
        }
        self.finished
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.run_id == run_id)
            .cloned()
    }

    /// Every run still held: in flight plus the recent finished ones, oldest
    /// update first.
    pub fn all(&self) -> Vec<Checkpoint> {
        let mut runs = self.in_flight();
        runs.extend(self.finished());
        runs.sort_by_key(|c| c.updated_at);
        runs
    }

    /// Runs not yet in a terminal state.
    pub fn in_flight(&self) -> Vec<Checkpoint> {
        let mut runs: Vec<Checkpoint> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        runs.sort_by_key(|c| c.updated_at);
        runs
    }

    /// Recently finished runs, oldest first. Never persisted.
    pub fn finished(&self) -> Vec<Checkpoint> {
        self.finished
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Mark every in-flight run as failed. Returns the affected run ids.
    pub fn recover_interrupted(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let mut recovered = Vec::new();
        for mut checkpoint in self.in_flight() {
            checkpoint.state = FlowState::Failed {
                reason: "interrupted".to_string(),
            };
            checkpoint.updated_at = Utc::now();
            self.record(&checkpoint)?;
            recovered.push(checkpoint.run_id);
        }
        if !recovered.is_empty() {
            log::info!("Marked {} interrupted runs as failed", recovered.len());
        }
        Ok(recovered)
    }

    pub fn len(&self) -> usize {
        let in_flight = self.runs.read().unwrap_or_else(PoisonError::into_inner).len();
        in_flight + self.finished.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::state::FlowRun;
    use std::sync::Arc;

    const BOB: &str = "O=Bob,L=Paris,C=FR";
    const ALICE: &str = "O=Alice,L=London,C=GB";

    fn json_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
            .count()
    }

    #[test]
    fn test_persist_and_recover_interrupted() {
        let dir = tempfile::tempdir().unwrap();

        let interrupted = {
            let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
            let mut done = FlowRun::start(
                Arc::clone(&store),
                ProtocolId::RequestKey,
                Role::Initiator,
                BOB,
            )
            .unwrap();
            done.advance(FlowState::AwaitingKeyOrId).unwrap();
            done.finish(Ok(())).unwrap();

            let mut interrupted = FlowRun::start(
                Arc::clone(&store),
                ProtocolId::SyncKeyMapping,
                Role::Responder,
                ALICE,
            )
            .unwrap();
            interrupted.advance(FlowState::Signing).unwrap();
            interrupted.run_id()
        };

        // only the unfinished run survives on disk
        assert_eq!(json_files(dir.path()), 1);
        let reopened = CheckpointStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        let in_flight: Vec<Uuid> = reopened.in_flight().iter().map(|c| c.run_id).collect();
        assert_eq!(in_flight, vec![interrupted]);

        assert_eq!(reopened.recover_interrupted().unwrap(), vec![interrupted]);
        assert!(reopened.in_flight().is_empty());
        assert!(matches!(
            reopened.get(interrupted).unwrap().state,
            FlowState::Failed { ref reason } if reason == "interrupted"
        ));

        // recovered runs are retired too
        assert_eq!(json_files(dir.path()), 0);
        assert!(CheckpointStore::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_completed_run_is_no_longer_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).unwrap().with_history(0));

        let mut run =
            FlowRun::start(Arc::clone(&store), ProtocolId::ShareKey, Role::Responder, BOB)
                .unwrap();
        run.advance(FlowState::Signing).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(json_files(dir.path()), 1);

        run.finish(Ok(())).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get(run.run_id()), None);
        assert_eq!(json_files(dir.path()), 0);
    }

    #[test]
    fn test_finished_history_is_bounded() {
        let store = Arc::new(CheckpointStore::new().with_history(2));

        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let mut run = FlowRun::start(
                    Arc::clone(&store),
                    ProtocolId::RequestKey,
                    Role::Initiator,
                    BOB,
                )
                .unwrap();
                run.finish(Ok(())).unwrap();
                run.run_id()
            })
            .collect();

        let kept: Vec<Uuid> = store.finished().iter().map(|c| c.run_id).collect();
        assert_eq!(kept, ids[1..].to_vec());
        assert_eq!(store.len(), 2);
        assert!(store.in_flight().is_empty());
    }

    #[test]
    fn test_len_survives_a_poisoned_lock() {
        let store = Arc::new(CheckpointStore::new());
        let run =
            FlowRun::start(Arc::clone(&store), ProtocolId::RequestKey, Role::Initiator, BOB)
                .unwrap();

        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.runs.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(store.runs.is_poisoned());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(run.run_id()).unwrap().state, FlowState::Init);
    }

    #[test]
    fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a checkpoint").unwrap();
        assert!(CheckpointStore::open(dir.path()).unwrap().is_empty());
    }
}
