//! Process-wide table of runs.
//!
//! The registry enforces single-flight execution: `begin` hands out at most one
//! `ActiveRun` guard per run, and only while the run is `Pending`. All access
//! goes through one mutex that is never held across an await.
//!
//! Memory is bounded two ways. A finished run becomes evictable once its
//! owner calls `ActiveRun::retire`, after the run's record is on disk; only
//! the newest `max_retained` retired runs stay. Pending runs that are never
//! started expire after `pending_ttl`. Evicted ids queue up until someone
//! drains them with `take_evicted` and drops their event logs.

use chrono::{TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorKind, PipelineError};
use crate::run::{PhaseResult, PhaseSummary, Run, RunFailure, RunId, RunOutcome, RunState};

/// Default number of finished runs kept in memory.
pub const DEFAULT_MAX_RETAINED_RUNS: usize = 200;

/// Default lifetime of a run that is registered but never started.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60 * 60);

struct RunEntry {
    run: Run,
    active: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    runs: HashMap<RunId, RunEntry>,
    /// Retired runs, oldest first.
    retired: VecDeque<RunId>,
    /// Removed from `runs`, not yet drained.
    evicted: Vec<RunId>,
}

impl RegistryInner {
    fn evict(&mut self, run_id: RunId) {
        self.runs.remove(&run_id);
        self.evicted.push(run_id);
    }
}

pub struct RunRegistry {
    inner: Mutex<RegistryInner>,
    max_retained: usize,
    pending_ttl: TimeDelta,
}

impl RunRegistry {
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_retained,
            pending_ttl: TimeDelta::from_std(DEFAULT_PENDING_TTL).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Expire never-started runs after `ttl`.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a `Pending` run. Blank requirements are rejected without
    /// creating an entry or issuing an id.
    pub fn register(&self, requirement: &str) -> Result<RunId, PipelineError> {
        if requirement.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "requirement must not be empty".to_string(),
            ));
        }

        let run = Run::new(requirement.trim());
        let run_id = run.id;
        let mut inner = self.lock();
        self.expire_pending(&mut inner);
        inner.runs.insert(
            run_id,
            RunEntry {
                run,
                active: false,
                cancel: CancellationToken::new(),
            },
        );
        tracing::debug!(run_id = %run_id, "Registered run");
        Ok(run_id)
    }

    fn expire_pending(&self, inner: &mut RegistryInner) {
        let now = Utc::now();
        let stale: Vec<RunId> = inner
            .runs
            .iter()
            .filter(|(_, e)| {
                !e.active
                    && e.run.state == RunState::Pending
                    && now - e.run.created_at >= self.pending_ttl
            })
            .map(|(id, _)| *id)
            .collect();
        for run_id in stale {
            tracing::info!(run_id = %run_id, "Expiring run that was never started");
            inner.evict(run_id);
        }
    }

    /// Ids removed since the last call. Their event logs can be dropped.
    pub fn take_evicted(&self) -> Vec<RunId> {
        std::mem::take(&mut self.lock().evicted)
    }

    /// Claim the single execution slot of a pending run.
    pub fn begin(self: &Arc<Self>, run_id: RunId) -> Result<ActiveRun, PipelineError> {
        let mut inner = self.lock();
        let entry = inner
            .runs
            .get_mut(&run_id)
            .ok_or(PipelineError::RunNotFound { run_id })?;

        if let Some(outcome) = entry.run.outcome() {
            return Err(PipelineError::RunAlreadyFinished { run_id, outcome });
        }
        if entry.active {
            return Err(PipelineError::RunAlreadyActive { run_id });
        }

        entry.active = true;
        entry.run.state = RunState::Running { phase_index: 0 };
        entry.run.started_at = Some(Utc::now());

        Ok(ActiveRun {
            registry: Arc::clone(self),
            run_id,
            requirement: entry.run.requirement.clone(),
            cancel: entry.cancel.clone(),
            finished: false,
            retired: false,
        })
    }

    /// Consistent copy of a run.
    pub fn snapshot(&self, run_id: RunId) -> Option<Run> {
        self.lock().runs.get(&run_id).map(|e| e.run.clone())
    }

    /// Copies of all runs in memory, newest first.
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.lock().runs.values().map(|e| e.run.clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.lock().runs.contains_key(&run_id)
    }

    /// Request cancellation. Returns `false` when the run is already terminal.
    ///
    /// A pending run keeps its cancelled token and ends `Cancelled` as soon as
    /// it is started.
    pub fn cancel(&self, run_id: RunId) -> Result<bool, PipelineError> {
        let inner = self.lock();
        let entry = inner
            .runs
            .get(&run_id)
            .ok_or(PipelineError::RunNotFound { run_id })?;
        if entry.run.state.is_terminal() {
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(run_id = %run_id, "Cancellation requested");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().runs.is_empty()
    }

    fn update<F: FnOnce(&mut Run)>(&self, run_id: RunId, f: F) {
        if let Some(entry) = self.lock().runs.get_mut(&run_id) {
            f(&mut entry.run);
        }
    }

    /// Move a run to its terminal state. It stays in memory until retired.
    fn finish(&self, run_id: RunId, outcome: RunOutcome, failure: Option<RunFailure>) -> Option<Run> {
        let mut inner = self.lock();
        let entry = inner.runs.get_mut(&run_id)?;

        entry.active = false;
        entry.run.state = outcome.state();
        entry.run.completed_at = Some(Utc::now());
        entry.run.failure = failure;
        Some(entry.run.clone())
    }

    /// Make a finished run evictable and evict the oldest retired runs beyond
    /// the retention limit.
    fn retire(&self, run_id: RunId) {
        let mut inner = self.lock();
        if !inner.runs.contains_key(&run_id) {
            return;
        }
        inner.retired.push_back(run_id);
        while inner.retired.len() > self.max_retained {
            if let Some(old) = inner.retired.pop_front() {
                inner.evict(old);
            }
        }
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED_RUNS)
    }
}

/// Exclusive handle on a running run. Only the holder mutates the run.
///
/// Dropping the guard without calling `finish` marks the run failed, so a
/// panicking sequencer never leaves a run stuck in `Running`. Dropping it
/// without `retire` retires the run.
pub struct ActiveRun {
    registry: Arc<RunRegistry>,
    run_id: RunId,
    requirement: String,
    cancel: CancellationToken,
    finished: bool,
    retired: bool,
}

impl ActiveRun {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn requirement(&self) -> &str {
        &self.requirement
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_phase(&self, phase_index: usize) {
        self.registry.update(self.run_id, |run| {
            run.state = RunState::Running { phase_index };
        });
    }

    pub fn push_result(&self, result: PhaseResult) {
        self.registry
            .update(self.run_id, |run| run.results.push(result));
    }

    pub fn push_summary(&self, summary: PhaseSummary) {
        self.registry
            .update(self.run_id, |run| run.phases.push(summary));
    }

    pub fn snapshot(&self) -> Option<Run> {
        self.registry.snapshot(self.run_id)
    }

    /// Record the terminal state and return the final run. The run is not
    /// evictable until `retire`.
    pub fn finish(&mut self, outcome: RunOutcome, failure: Option<RunFailure>) -> Option<Run> {
        self.finished = true;
        self.registry.finish(self.run_id, outcome, failure)
    }

    /// Hand the finished run over to eviction. Returns every id evicted so far
    /// and not yet drained, this run's included when the limit is zero.
    pub fn retire(mut self) -> Vec<RunId> {
        self.retired = true;
        self.registry.retire(self.run_id);
        self.registry.take_evicted()
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(run_id = %self.run_id, "Run dropped before finishing");
            self.registry.finish(
                self.run_id,
                RunOutcome::Failed,
                Some(RunFailure {
                    phase: String::new(),
                    round: 0,
                    kind: ErrorKind::Internal,
                    message: "run aborted before reaching a terminal state".to_string(),
                }),
            );
        }
        if !self.retired {
            self.registry.retire(self.run_id);
        }
    }
}
