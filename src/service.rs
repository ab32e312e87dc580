//! The library's front door: submit, start, cancel, observe and look up runs.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::PipewrightConfig;
use crate::errors::{PipelineError, StoreError};
use crate::events::{EventBroadcaster, Subscription};
use crate::executor::{GenerationSettings, PhaseExecutor};
use crate::gateway::{GenerationGateway, OpenAiCompatGateway};
use crate::phase::PipelineTopology;
use crate::registry::{DEFAULT_MAX_RETAINED_RUNS, DEFAULT_PENDING_TTL, RunRegistry};
use crate::run::{Run, RunId};
use crate::sequencer::{DEFAULT_CHUNK_SIZE, Sequencer};
use crate::store::{ArtifactStore, EventJournal, Manifest, RunSummary};

/// Knobs for building a service by hand.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub output_dir: PathBuf,
    pub settings: GenerationSettings,
    pub chunk_size: usize,
    pub max_retained_runs: usize,
    pub pending_ttl: Duration,
}

impl ServiceOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            settings: GenerationSettings::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retained_runs: DEFAULT_MAX_RETAINED_RUNS,
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }
}

/// Everything known about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run_id: RunId,
    pub state: String,
    /// Live record, while the run is still held in memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<Run>,
    /// Permanent record, once the run has finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

type RunTask = JoinHandle<Result<Run, PipelineError>>;

pub struct PipelineService {
    registry: Arc<RunRegistry>,
    events: Arc<EventBroadcaster>,
    store: ArtifactStore,
    topology: Arc<PipelineTopology>,
    sequencer: Arc<Sequencer>,
    tasks: Mutex<HashMap<RunId, RunTask>>,
}

impl PipelineService {
    pub fn new(
        gateway: Arc<dyn GenerationGateway>,
        topology: PipelineTopology,
        options: ServiceOptions,
    ) -> Self {
        let store = ArtifactStore::new(options.output_dir);
        let journal: Arc<dyn EventJournal> = Arc::new(store.clone());
        let events = Arc::new(EventBroadcaster::new(Some(journal)));
        let topology = Arc::new(topology);
        let executor = Arc::new(PhaseExecutor::new(gateway, store.clone(), options.settings));
        let sequencer = Sequencer::new(topology.clone(), executor, events.clone())
            .with_chunk_size(options.chunk_size);

        Self {
            registry: Arc::new(
                RunRegistry::new(options.max_retained_runs).with_pending_ttl(options.pending_ttl),
            ),
            events,
            store,
            topology,
            sequencer: Arc::new(sequencer),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a service talking to the configured OpenAI-compatible backend.
    pub fn from_config(config: &PipewrightConfig) -> anyhow::Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "));
        }

        let mut gateway =
            OpenAiCompatGateway::new(config.toml.gateway.base_url.clone(), config.gateway_timeout());
        if let Some(key) = &config.toml.gateway.api_key {
            gateway = gateway.with_api_key(key.clone());
        }

        let options = ServiceOptions {
            output_dir: config.output_dir(),
            settings: config.generation_settings(),
            chunk_size: config.toml.pipeline.chunk_size,
            max_retained_runs: config.toml.registry.max_retained_runs,
            pending_ttl: config.pending_ttl(),
        };
        Ok(Self::new(Arc::new(gateway), config.topology()?, options))
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<RunId, RunTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn topology(&self) -> &PipelineTopology {
        &self.topology
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Create a pending run. Its event log opens right away so observers can
    /// subscribe before it starts.
    pub fn register(&self, requirement: &str) -> Result<RunId, PipelineError> {
        let run_id = self.registry.register(requirement)?;
        self.events.open(run_id);
        self.drop_evicted();
        Ok(run_id)
    }

    /// Forget the event logs of runs the registry let go of.
    fn drop_evicted(&self) {
        for run_id in self.registry.take_evicted() {
            self.events.remove(run_id);
            self.store.release(run_id);
        }
    }

    /// Start a pending run on its own task. Only the first start succeeds.
    pub fn start(&self, run_id: RunId) -> Result<(), PipelineError> {
        let active = self.registry.begin(run_id)?;
        let sequencer = self.sequencer.clone();
        let handle = tokio::spawn(async move { sequencer.execute(active).await });

        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(run_id, handle);
        Ok(())
    }

    /// Register and start in one step.
    pub fn submit(&self, requirement: &str) -> Result<RunId, PipelineError> {
        let run_id = self.register(requirement)?;
        self.start(run_id)?;
        Ok(run_id)
    }

    /// Request cancellation. `Ok(false)` when the run has already finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, PipelineError> {
        match self.registry.cancel(run_id) {
            Err(PipelineError::RunNotFound { .. }) if self.on_disk(run_id).await? => Ok(false),
            other => other,
        }
    }

    /// Wait for a started run to finish. Runs not executing return their
    /// current snapshot.
    pub async fn wait(&self, run_id: RunId) -> Result<Run, PipelineError> {
        let handle = self.tasks().remove(&run_id);
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| PipelineError::Internal(format!("run task failed: {e}")))?,
            None => self
                .registry
                .snapshot(run_id)
                .ok_or(PipelineError::RunNotFound { run_id }),
        }
    }

    /// Events of a run from the first one on, live while it executes. Runs no
    /// longer in memory are replayed from disk.
    pub async fn subscribe(&self, run_id: RunId) -> Result<Subscription, PipelineError> {
        if let Some(subscription) = self.events.subscribe(run_id) {
            return Ok(subscription);
        }

        // The journal is appended per event, so it is never behind a
        // conversation log that was cut short.
        let log = self.store.load_conversation_log(run_id).await?;
        let journal = self.store.load_journal(run_id).await?;
        let stored = match (log, journal) {
            (Some(log), Some(journal)) if journal.len() > log.len() => Some(journal),
            (Some(log), _) => Some(log),
            (None, journal) => journal,
        };
        stored
            .map(Subscription::replay)
            .ok_or(PipelineError::RunNotFound { run_id })
    }

    /// Every known run, newest first: runs in memory plus manifests on disk.
    pub async fn history(&self) -> Result<Vec<RunSummary>, PipelineError> {
        let live = self.registry.list();
        let live_ids: HashSet<RunId> = live.iter().map(|r| r.id).collect();

        let mut summaries: Vec<RunSummary> = live.iter().map(RunSummary::from_run).collect();
        summaries.extend(
            self.store
                .list_manifests()
                .await?
                .iter()
                .filter(|m| !live_ids.contains(&m.run_id))
                .map(RunSummary::from_manifest),
        );
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    pub async fn detail(&self, run_id: RunId) -> Result<RunDetail, PipelineError> {
        let run = self.registry.snapshot(run_id);
        let manifest = self.store.load_manifest(run_id).await?;

        let state = match (&run, &manifest) {
            (Some(run), _) => run.state.as_str(),
            (None, Some(manifest)) => manifest.outcome.state().as_str(),
            (None, None) => return Err(PipelineError::RunNotFound { run_id }),
        };

        Ok(RunDetail {
            run_id,
            state: state.to_string(),
            run,
            manifest,
        })
    }

    /// Content of one artifact file of a run.
    pub async fn artifact(&self, run_id: RunId, file_name: &str) -> Result<Option<String>, PipelineError> {
        if !self.registry.contains(run_id) && !self.on_disk(run_id).await? {
            return Err(PipelineError::RunNotFound { run_id });
        }
        match self.store.read_artifact(run_id, file_name).await {
            Ok(content) => Ok(content),
            Err(StoreError::InvalidFileName(name)) => Err(PipelineError::InvalidInput(format!(
                "invalid artifact file name '{name}'"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Lossy feed of every event of every run, as JSON.
    pub fn firehose(&self) -> broadcast::Sender<String> {
        self.events.firehose()
    }

    async fn on_disk(&self, run_id: RunId) -> Result<bool, PipelineError> {
        let manifest = self.store.load_manifest(run_id).await?;
        Ok(manifest.is_some() || tokio::fs::try_exists(self.store.run_dir(run_id)).await.unwrap_or(false))
    }
}
