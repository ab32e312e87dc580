//! Drives a run through the pipeline and owns its state machine.
//!
//! ```text
//! Pending -> Running{phase_index} -> Succeeded | Failed | Cancelled
//! ```
//!
//! Steps run strictly in order on the run's own task. Terminal bookkeeping
//! always happens in the same order: registry state, terminal event, the
//! manifest and conversation log on disk, then retirement. A run can only be
//! evicted from memory once its record is on disk.

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::errors::PipelineError;
use crate::events::{EventBroadcaster, EventKind};
use crate::executor::PhaseExecutor;
use crate::phase::{PhaseDefinition, PipelineTopology, Step};
use crate::prompt::{PhaseInput, PriorArtifact};
use crate::registry::ActiveRun;
use crate::revision::run_revision;
use crate::run::{PhaseResult, PhaseStatus, PhaseSummary, Run, RunFailure, RunId, RunOutcome};
use crate::store::{ArtifactStore, Manifest};
use crate::util::chunk_text;
use crate::verdict::Verdict;

/// Default size of `phase_chunk` payloads, in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 4000;

/// Per-run execution state shared by the sequencer and the revision loop.
pub(crate) struct RunContext<'a> {
    active: &'a ActiveRun,
    events: &'a EventBroadcaster,
    topology: &'a PipelineTopology,
    chunk_size: usize,
    prior: Vec<PriorArtifact>,
    /// Phase and round currently executing, for failure attribution.
    current: Option<(String, u32)>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn run_id(&self) -> RunId {
        self.active.run_id()
    }

    pub(crate) fn topology(&self) -> &'a PipelineTopology {
        self.topology
    }

    pub(crate) fn cancel_token(&self) -> &'a CancellationToken {
        self.active.cancel_token()
    }

    pub(crate) fn ensure_not_cancelled(&self) -> Result<(), PipelineError> {
        if self.active.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn emit(&self, kind: EventKind, phase: Option<&str>, payload: serde_json::Value) {
        self.events.emit(self.run_id(), kind, phase, payload);
    }

    /// Input for the next phase: the requirement plus every canonical artifact so far.
    pub(crate) fn input(&self) -> PhaseInput {
        PhaseInput::new(self.active.requirement(), self.prior.clone())
    }

    pub(crate) fn push_prior(&mut self, definition: &PhaseDefinition, content: &str) {
        self.prior.push(PriorArtifact {
            phase: definition.name.clone(),
            title: definition.title.clone(),
            content: content.to_string(),
        });
    }

    /// Point the run at phase `index` without announcing it.
    pub(crate) fn set_current(&mut self, index: usize, round: u32) {
        let definition = self.topology.phase(index);
        self.active.set_phase(index);
        self.current = Some((definition.name.clone(), round));
    }

    pub(crate) fn phase_started(&mut self, index: usize) {
        self.set_current(index, 1);
        let definition = self.topology.phase(index);
        tracing::info!(phase = %definition.name, agent = %definition.agent, "Phase started");
        self.emit(
            EventKind::PhaseStarted,
            Some(&definition.name),
            json!({
                "ordinal": definition.ordinal,
                "title": definition.title,
                "agent": definition.agent,
                "model": definition.model,
            }),
        );
    }

    /// Append a result to the run and stream its text as `phase_chunk` events.
    pub(crate) fn record(&mut self, result: &PhaseResult) {
        self.active.push_result(result.clone());

        let chunks = chunk_text(&result.artifact, self.chunk_size);
        let total = chunks.len();
        for (index, text) in chunks.into_iter().enumerate() {
            self.emit(
                EventKind::PhaseChunk,
                Some(&result.phase),
                json!({
                    "round": result.round,
                    "index": index,
                    "total": total,
                    "text": text,
                }),
            );
        }
    }

    pub(crate) fn revision_round(&self, result: &PhaseResult, role: &str, max_rounds: u32) {
        self.emit(
            EventKind::RevisionRound,
            Some(&result.phase),
            json!({
                "role": role,
                "round": result.round,
                "max_rounds": max_rounds,
                "verdict": result.verdict,
                "artifact_file": result.artifact_file,
                "latency_ms": result.latency_ms,
            }),
        );
    }

    pub(crate) fn phase_completed(
        &self,
        definition: &PhaseDefinition,
        status: PhaseStatus,
        rounds: u32,
        verdict: Option<Verdict>,
    ) {
        let summary = PhaseSummary {
            name: definition.name.clone(),
            ordinal: definition.ordinal,
            title: definition.title.clone(),
            agent: definition.agent.clone(),
            model: definition.model.clone(),
            artifact_file: definition.artifact_file_name(),
            rounds,
            status,
            verdict,
        };
        self.active.push_summary(summary);

        tracing::info!(phase = %definition.name, status = %status, rounds, "Phase completed");
        self.emit(
            EventKind::PhaseCompleted,
            Some(&definition.name),
            json!({
                "ordinal": definition.ordinal,
                "title": definition.title,
                "status": status,
                "rounds": rounds,
                "artifact_file": definition.artifact_file_name(),
                "verdict": verdict,
            }),
        );
    }

    fn failure(&self, error: &PipelineError) -> RunFailure {
        let (phase, round) = match error {
            PipelineError::PhaseFailed { phase, round, .. } => (phase.clone(), *round),
            _ => self.current.clone().unwrap_or_default(),
        };
        RunFailure {
            phase,
            round,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Executes runs against one pipeline topology.
pub struct Sequencer {
    topology: Arc<PipelineTopology>,
    executor: Arc<PhaseExecutor>,
    events: Arc<EventBroadcaster>,
    chunk_size: usize,
}

impl Sequencer {
    pub fn new(
        topology: Arc<PipelineTopology>,
        executor: Arc<PhaseExecutor>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            topology,
            executor,
            events,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    fn store(&self) -> &ArtifactStore {
        self.executor.store()
    }

    /// Run every step, then finish the run and persist its record.
    pub async fn execute(&self, active: ActiveRun) -> Result<Run, PipelineError> {
        let run_id = active.run_id();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.execute_inner(active).instrument(span).await
    }

    async fn execute_inner(&self, mut active: ActiveRun) -> Result<Run, PipelineError> {
        let run_id = active.run_id();
        let mut ctx = RunContext {
            active: &active,
            events: &self.events,
            topology: &self.topology,
            chunk_size: self.chunk_size,
            prior: Vec::new(),
            current: None,
        };

        let plan: Vec<_> = self
            .topology
            .phases()
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "ordinal": p.ordinal,
                    "title": p.title,
                    "agent": p.agent,
                    "model": p.model,
                    "role": p.role,
                })
            })
            .collect();
        tracing::info!(phases = plan.len(), "Run started");
        ctx.emit(
            EventKind::RunStarted,
            None,
            json!({ "requirement": active.requirement(), "phases": plan }),
        );

        let result = match self.store().init_run(run_id).await {
            Ok(_) => self.run_steps(&mut ctx).await,
            Err(e) => Err(e.into()),
        };

        let failure = match &result {
            Ok(()) | Err(PipelineError::Cancelled) => None,
            Err(e) => Some(ctx.failure(e)),
        };
        let outcome = match (&result, &failure) {
            (Ok(()), _) => RunOutcome::Succeeded,
            (_, Some(_)) => RunOutcome::Failed,
            _ => RunOutcome::Cancelled,
        };
        let current_phase = ctx.current.as_ref().map(|(phase, _)| phase.clone());
        drop(ctx);

        let run = active
            .finish(outcome, failure.clone())
            .ok_or(PipelineError::RunNotFound { run_id })?;

        match &failure {
            Some(failure) => {
                tracing::error!(
                    phase = %failure.phase,
                    round = failure.round,
                    kind = %failure.kind,
                    "Run failed: {}",
                    failure.message
                );
                let phase = (!failure.phase.is_empty()).then_some(failure.phase.as_str());
                self.events.emit(
                    run_id,
                    EventKind::RunFailed,
                    phase,
                    json!({
                        "phase": failure.phase,
                        "round": failure.round,
                        "error_kind": failure.kind,
                        "message": failure.message,
                    }),
                );
            }
            None if outcome == RunOutcome::Cancelled => {
                tracing::info!(phase = ?current_phase, "Run cancelled");
                self.events.emit(
                    run_id,
                    EventKind::RunCancelled,
                    current_phase.as_deref(),
                    json!({ "phase": current_phase, "results": run.results.len() }),
                );
            }
            None => {
                tracing::info!(elapsed_seconds = run.elapsed_seconds(), "Run completed");
                self.events.emit(
                    run_id,
                    EventKind::RunCompleted,
                    None,
                    json!({
                        "outcome": outcome,
                        "elapsed_seconds": run.elapsed_seconds(),
                        "results": run.results.len(),
                    }),
                );
            }
        }

        self.persist(&run).await;
        self.store().release(run_id);

        for evicted_id in active.retire() {
            self.events.remove(evicted_id);
            self.store().release(evicted_id);
        }

        Ok(run)
    }

    async fn run_steps(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let run_id = ctx.run_id();

        for step in self.topology.steps() {
            ctx.ensure_not_cancelled()?;

            match *step {
                Step::Single(index) => {
                    let definition = self.topology.phase(index);
                    ctx.phase_started(index);

                    let result = self
                        .executor
                        .execute(run_id, definition, ctx.input(), 1, ctx.cancel_token())
                        .await?;
                    ctx.record(&result);
                    ctx.ensure_not_cancelled()?;

                    ctx.push_prior(definition, &result.artifact);
                    ctx.phase_completed(definition, PhaseStatus::Completed, 1, None);
                }
                Step::Revision {
                    producer,
                    critic,
                    max_rounds,
                } => {
                    let outcome =
                        run_revision(ctx, &self.executor, producer, critic, max_rounds).await?;

                    let producer_def = self.topology.phase(producer);
                    let critic_def = self.topology.phase(critic);
                    ctx.push_prior(producer_def, &outcome.producer.artifact);
                    ctx.push_prior(critic_def, &outcome.critic.artifact);
                    ctx.phase_completed(producer_def, outcome.status, outcome.rounds, None);
                    ctx.phase_completed(
                        critic_def,
                        outcome.status,
                        outcome.rounds,
                        outcome.critic.verdict,
                    );
                }
            }
        }
        Ok(())
    }

    /// Write the manifest and the conversation log. Failures are logged; the run
    /// outcome stands.
    async fn persist(&self, run: &Run) {
        let manifest = Manifest::from_run(run, &self.topology);
        if let Err(e) = self.store().write_manifest(&manifest).await {
            tracing::error!(error = %e, "Failed to write manifest");
        }

        let events = self.events.events(run.id).unwrap_or_default();
        if let Err(e) = self.store().write_conversation_log(run.id, &events).await {
            tracing::error!(error = %e, "Failed to write conversation log");
        }
    }
}
