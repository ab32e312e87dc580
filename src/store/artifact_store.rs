use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{CONVERSATION_LOG_FILE, EventJournal, JOURNAL_FILE, MANIFEST_FILE, Manifest};
use crate::errors::StoreError;
use crate::events::Event;
use crate::run::RunId;

/// File-backed store with one directory per run.
///
/// Writes for one run are serialised by a per-run async lock; different runs
/// never wait on each other. Each run's journal stays open in append mode
/// until the run is released.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    locks: Arc<DashMap<RunId, Arc<Mutex<()>>>>,
    journals: Arc<DashMap<RunId, Arc<std::fs::File>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(DashMap::new()),
            journals: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn lock_for(&self, run_id: RunId) -> Arc<Mutex<()>> {
        self.locks.entry(run_id).or_default().clone()
    }

    /// Create the run directory.
    pub async fn init_run(&self, run_id: RunId) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Write {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    /// Write an artifact file. `file_name` is relative to the run directory and
    /// may contain subdirectories (`rounds/02_code.r1.py`).
    pub async fn write_artifact(
        &self,
        run_id: RunId,
        file_name: &str,
        content: &str,
    ) -> Result<PathBuf, StoreError> {
        validate_file_name(file_name)?;
        let path = self.run_dir(run_id).join(file_name);

        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(run_id = %run_id, file = file_name, bytes = content.len(), "Wrote artifact");
        Ok(path)
    }

    /// Read an artifact. `Ok(None)` when the file does not exist.
    pub async fn read_artifact(
        &self,
        run_id: RunId,
        file_name: &str,
    ) -> Result<Option<String>, StoreError> {
        validate_file_name(file_name)?;
        read_optional(&self.run_dir(run_id).join(file_name)).await
    }

    pub async fn write_manifest(&self, manifest: &Manifest) -> Result<PathBuf, StoreError> {
        self.write_json_atomic(manifest.run_id, MANIFEST_FILE, "manifest", manifest)
            .await
    }

    pub async fn write_conversation_log(
        &self,
        run_id: RunId,
        events: &[Event],
    ) -> Result<PathBuf, StoreError> {
        self.write_json_atomic(run_id, CONVERSATION_LOG_FILE, "conversation log", &events)
            .await
    }

    pub async fn load_manifest(&self, run_id: RunId) -> Result<Option<Manifest>, StoreError> {
        load_json(&self.run_dir(run_id).join(MANIFEST_FILE)).await
    }

    pub async fn load_conversation_log(
        &self,
        run_id: RunId,
    ) -> Result<Option<Vec<Event>>, StoreError> {
        load_json(&self.run_dir(run_id).join(CONVERSATION_LOG_FILE)).await
    }

    /// Events from the journal, for runs that never reached the conversation
    /// log. Unreadable lines are skipped.
    pub async fn load_journal(&self, run_id: RunId) -> Result<Option<Vec<Event>>, StoreError> {
        let path = self.run_dir(run_id).join(JOURNAL_FILE);
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };

        let events = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Event>(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping bad journal line");
                    None
                }
            })
            .collect();
        Ok(Some(events))
    }

    /// Manifests of all finished runs, newest first. Unreadable manifests are
    /// logged and skipped.
    pub async fn list_manifests(&self) -> Result<Vec<Manifest>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut manifests = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Read {
                path: self.root.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };

            let path = entry.path().join(MANIFEST_FILE);
            match load_json::<Manifest>(&path).await {
                Ok(Some(manifest)) => manifests.push(manifest),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(manifests)
    }

    /// Drop the per-run lock and close the journal once a run is finished.
    pub fn release(&self, run_id: RunId) {
        self.locks.remove(&run_id);
        self.journals.remove(&run_id);
    }

    pub(crate) fn open_journals(&self) -> usize {
        self.journals.len()
    }

    fn journal_for(&self, run_id: RunId) -> Result<Arc<std::fs::File>, StoreError> {
        if let Some(file) = self.journals.get(&run_id) {
            return Ok(file.clone());
        }
        let file = self
            .journals
            .entry(run_id)
            .or_try_insert_with(|| {
                let dir = self.run_dir(run_id);
                std::fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
                    path: dir.clone(),
                    source,
                })?;
                let path = dir.join(JOURNAL_FILE);
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map(Arc::new)
                    .map_err(|source| StoreError::Write { path, source })
            })?
            .clone();
        Ok(file)
    }

    async fn write_json_atomic<T: Serialize + ?Sized>(
        &self,
        run_id: RunId,
        file_name: &str,
        what: &'static str,
        value: &T,
    ) -> Result<PathBuf, StoreError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|source| StoreError::Serialize { what, source })?;

        let dir = self.run_dir(run_id);
        let path = dir.join(file_name);
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Write {
                path: dir.clone(),
                source,
            })?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

impl EventJournal for ArtifactStore {
    /// One `write` per event on the run's open journal handle.
    fn append(&self, event: &Event) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event).map_err(|source| StoreError::Serialize {
            what: "event",
            source,
        })?;
        line.push('\n');

        let file = self.journal_for(event.run_id)?;
        (&*file)
            .write_all(line.as_bytes())
            .map_err(|source| StoreError::Write {
                path: self.run_dir(event.run_id).join(JOURNAL_FILE),
                source,
            })
    }
}

/// Only plain relative paths inside the run directory are allowed.
fn validate_file_name(file_name: &str) -> Result<(), StoreError> {
    let path = Path::new(file_name);
    let plain = !file_name.is_empty()
        && !file_name.contains('\\')
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(StoreError::InvalidFileName(file_name.to_string()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let Some(content) = read_optional(path).await? else {
        return Ok(None);
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::phase::PipelineTopology;
    use crate::run::{Run, RunState};
    use chrono::Utc;
    use tempfile::TempDir;

    fn event(run_id: RunId, seq: u64) -> Event {
        Event {
            run_id,
            seq,
            kind: EventKind::PhaseStarted,
            phase: Some("a".to_string()),
            timestamp: Utc::now(),
            payload: serde_json::json!({"ordinal": 1}),
        }
    }

    fn finished_run(requirement: &str) -> Run {
        let mut run = Run::new(requirement);
        run.state = RunState::Succeeded;
        run.completed_at = Some(Utc::now());
        run
    }

    #[tokio::test]
    async fn test_write_and_read_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run_id = RunId::new();

        store.init_run(run_id).await.unwrap();
        let path = store
            .write_artifact(run_id, "rounds/02_code.r1.py", "print(1)")
            .await
            .unwrap();
        assert!(path.ends_with("rounds/02_code.r1.py"));

        let content = store.read_artifact(run_id, "rounds/02_code.r1.py").await.unwrap();
        assert_eq!(content.as_deref(), Some("print(1)"));
        assert_eq!(store.read_artifact(run_id, "missing.md").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_escaping_file_names() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run_id = RunId::new();

        for bad in ["../x.md", "/etc/passwd", "", "a/../../b", "..\\x"] {
            let err = store.write_artifact(run_id, bad, "x").await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidFileName(_)), "{bad}");
        }
        assert!(store.read_artifact(run_id, "../manifest.json").await.is_err());
    }

    #[tokio::test]
    async fn test_manifest_written_atomically_and_listed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let topology = PipelineTopology::default_pipeline();

        let first = finished_run("first");
        let mut second = finished_run("second");
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        store.write_manifest(&Manifest::from_run(&first, &topology)).await.unwrap();
        store.write_manifest(&Manifest::from_run(&second, &topology)).await.unwrap();

        let run_dir = store.run_dir(first.id);
        assert!(run_dir.join(MANIFEST_FILE).exists());
        assert!(!run_dir.join(".manifest.json.tmp").exists());

        let listed = store.list_manifests().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].requirement, "second");

        let loaded = store.load_manifest(first.id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, first.id);
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_manifest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run = finished_run("ok");
        store
            .write_manifest(&Manifest::from_run(&run, &PipelineTopology::default_pipeline()))
            .await
            .unwrap();

        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE), "{not json").unwrap();
        std::fs::create_dir_all(dir.path().join("in-progress")).unwrap();

        let listed = store.list_manifests().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("nope"));
        assert!(store.list_manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_journal_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run_id = RunId::new();

        for seq in 1..=3 {
            store.append(&event(run_id, seq)).unwrap();
        }
        let journal = store.load_journal(run_id).await.unwrap().unwrap();
        let seqs: Vec<u64> = journal.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_journal_handle_is_kept_until_release() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (first, second) = (RunId::new(), RunId::new());

        for seq in 1..=50 {
            store.append(&event(first, seq)).unwrap();
            store.append(&event(second, seq)).unwrap();
        }
        assert_eq!(store.open_journals(), 2);

        store.release(first);
        assert_eq!(store.open_journals(), 1);

        for run_id in [first, second] {
            let journal = store.load_journal(run_id).await.unwrap().unwrap();
            let seqs: Vec<u64> = journal.iter().map(|e| e.seq).collect();
            assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
        }

        // A released run reopens its journal and keeps appending
        store.append(&event(first, 51)).unwrap();
        let journal = store.load_journal(first).await.unwrap().unwrap();
        assert_eq!(journal.len(), 51);
    }

    #[tokio::test]
    async fn test_conversation_log_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run_id = RunId::new();
        let events = vec![event(run_id, 1), event(run_id, 2)];

        assert!(store.load_conversation_log(run_id).await.unwrap().is_none());
        store.write_conversation_log(run_id, &events).await.unwrap();
        let loaded = store.load_conversation_log(run_id).await.unwrap().unwrap();
        assert_eq!(loaded, events);
    }
}
