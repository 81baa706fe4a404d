// store.rs — RunStore: one JSON record per run under `.mesh/runs/<id>/run.json`.
//
// The record is an index entry, not the source of truth: a run's state is
// rebuilt from its ledger journal. The store answers "which runs exist, for
// which ticket, and which were still live" so the supervisor can resume them.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mesh_audit::RunState;
use serde::{Deserialize, Serialize};

use crate::config::MeshPaths;
use crate::error::RunError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub ticket_id: String,
    pub tenant: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub journal: PathBuf,
    /// Set once the run is sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_path: Option<PathBuf>,
}

impl RunRecord {
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

pub struct RunStore {
    paths: MeshPaths,
}

impl RunStore {
    pub fn new(paths: MeshPaths) -> Result<Self, RunError> {
        fs::create_dir_all(&paths.runs_dir).map_err(|source| RunError::Io {
            path: paths.runs_dir.clone(),
            source,
        })?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &MeshPaths {
        &self.paths
    }

    /// Save a record (creates or overwrites).
    pub fn save(&self, record: &RunRecord) -> Result<(), RunError> {
        let dir = self.paths.run_dir(&record.run_id);
        fs::create_dir_all(&dir).map_err(|source| RunError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = self.paths.record(&record.run_id);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).map_err(|source| RunError::Io { path, source })?;
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<RunRecord>, RunError> {
        let path = self.paths.record(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|source| RunError::Io { path, source })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<RunRecord>, RunError> {
        let dir = &self.paths.runs_dir;
        let entries = fs::read_dir(dir).map_err(|source| RunError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RunError::Io {
                path: dir.clone(),
                source,
            })?;
            let Some(run_id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if let Some(record) = self.get(&run_id)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Non-terminal runs.
    pub fn live(&self) -> Result<Vec<RunRecord>, RunError> {
        Ok(self.list()?.into_iter().filter(RunRecord::is_live).collect())
    }

    pub fn latest_for_ticket(&self, ticket_id: &str) -> Result<Option<RunRecord>, RunError> {
        Ok(self.list()?.into_iter().find(|r| r.ticket_id == ticket_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(run_id: &str, ticket_id: &str, state: RunState, minutes_ago: i64) -> RunRecord {
        let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        RunRecord {
            run_id: run_id.into(),
            ticket_id: ticket_id.into(),
            tenant: "acme".into(),
            state,
            created_at: at,
            updated_at: at,
            journal: PathBuf::from(format!("{run_id}/ledger.jsonl")),
            pack_path: None,
        }
    }

    #[test]
    fn save_and_get() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(MeshPaths::for_project(dir.path())).unwrap();
        let rec = record("r1", "ZD-1", RunState::IssueCreated, 0);
        store.save(&rec).unwrap();
        assert_eq!(store.get("r1").unwrap(), Some(rec));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn list_is_newest_first_and_live_filters_terminal() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(MeshPaths::for_project(dir.path())).unwrap();
        store.save(&record("old", "ZD-1", RunState::Resolved, 30)).unwrap();
        store.save(&record("new", "ZD-1", RunState::AwaitingApproval, 5)).unwrap();
        store.save(&record("other", "ZD-2", RunState::Failed, 10)).unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec!["new", "other", "old"]);
        let live: Vec<String> = store.live().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(live, vec!["new"]);
        assert_eq!(store.latest_for_ticket("ZD-1").unwrap().unwrap().run_id, "new");
    }

    #[test]
    fn directories_without_record_are_skipped() {
        let dir = tempdir().unwrap();
        let paths = MeshPaths::for_project(dir.path());
        let store = RunStore::new(paths.clone()).unwrap();
        fs::create_dir_all(paths.run_dir("half-written")).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
