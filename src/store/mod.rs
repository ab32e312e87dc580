//! Durable record of runs: artifacts, the event journal and the manifest.
//!
//! On-disk layout, one directory per run under the output root:
//!
//! ```text
//! <output_dir>/<run_id>/
//!   01_specification.md      canonical artifact per phase
//!   rounds/02_code.r1.py     every round of a revised phase
//!   events.jsonl             journal, appended as events are emitted
//!   conversation_log.json    full ordered event list, written at the end
//!   manifest.json            run summary, written once, atomically
//! ```

mod artifact_store;

pub use artifact_store::ArtifactStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::StoreError;
use crate::events::Event;
use crate::phase::PipelineTopology;
use crate::run::{
    PhaseResult, PhaseStatus, PhaseSummary, Run, RunFailure, RunId, RunOutcome,
};
use crate::util::summarize;
use crate::verdict::Verdict;

/// File names inside a run directory.
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CONVERSATION_LOG_FILE: &str = "conversation_log.json";
pub const JOURNAL_FILE: &str = "events.jsonl";

/// Length limit of the requirement shown in history listings.
pub const REQUIREMENT_SUMMARY_CHARS: usize = 120;

/// Sink for events as they are emitted. Called synchronously from the
/// broadcaster, in sequence order.
pub trait EventJournal: Send + Sync {
    fn append(&self, event: &Event) -> Result<(), StoreError>;
}

/// Phase result metadata as kept in the manifest. The artifact body lives in
/// its own file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub phase: String,
    pub ordinal: u32,
    pub round: u32,
    pub artifact_file: String,
    pub model: String,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub chars: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl From<&PhaseResult> for PhaseRecord {
    fn from(result: &PhaseResult) -> Self {
        Self {
            phase: result.phase.clone(),
            ordinal: result.ordinal,
            round: result.round,
            artifact_file: result.artifact_file.clone(),
            model: result.model.clone(),
            latency_ms: result.latency_ms,
            attempts: result.attempts,
            verdict: result.verdict,
            chars: result.artifact.chars().count(),
            started_at: result.started_at,
            ended_at: result.ended_at,
        }
    }
}

/// Permanent summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub run_id: RunId,
    pub requirement: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// One entry per phase definition, in pipeline order.
    pub phases: Vec<PhaseSummary>,
    pub results: Vec<PhaseRecord>,
}

impl Manifest {
    /// Build the manifest of a terminal run. A phase without a summary is
    /// `failed` when the failure names it or when it produced results in a
    /// failed run, `interrupted` when it produced results in a cancelled run,
    /// and `not_run` otherwise.
    pub fn from_run(run: &Run, topology: &PipelineTopology) -> Self {
        let phases = topology
            .phases()
            .iter()
            .map(|def| {
                if let Some(summary) = run.phases.iter().find(|s| s.name == def.name) {
                    return summary.clone();
                }
                let rounds = run.rounds_for(&def.name);
                let named = run.failure.as_ref().is_some_and(|f| f.phase == def.name);
                let status = match (named, rounds, run.outcome()) {
                    (true, _, _) => PhaseStatus::Failed,
                    (false, 0, _) => PhaseStatus::NotRun,
                    (false, _, Some(RunOutcome::Cancelled)) => PhaseStatus::Interrupted,
                    (false, _, _) => PhaseStatus::Failed,
                };
                PhaseSummary {
                    name: def.name.clone(),
                    ordinal: def.ordinal,
                    title: def.title.clone(),
                    agent: def.agent.clone(),
                    model: def.model.clone(),
                    artifact_file: def.artifact_file_name(),
                    rounds,
                    status,
                    verdict: None,
                }
            })
            .collect();

        let completed_at = run.completed_at.unwrap_or_else(Utc::now);
        let start = run.started_at.unwrap_or(run.created_at);

        Self {
            run_id: run.id,
            requirement: run.requirement.clone(),
            created_at: run.created_at,
            completed_at,
            outcome: run.outcome().unwrap_or(RunOutcome::Failed),
            elapsed_seconds: (completed_at - start).num_milliseconds() as f64 / 1000.0,
            failure: run.failure.clone(),
            phases,
            results: run.results.iter().map(PhaseRecord::from).collect(),
        }
    }

    /// Phases that produced at least one result.
    pub fn phases_run(&self) -> usize {
        self.phases.iter().filter(|p| p.rounds > 0).count()
    }
}

/// One line of the history listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    /// Requirement cut to a single short line.
    pub requirement: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    pub phase_count: usize,
}

impl RunSummary {
    pub fn from_run(run: &Run) -> Self {
        let phase_count = run
            .results
            .iter()
            .map(|r| r.phase.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            run_id: run.id,
            requirement: summarize(&run.requirement, REQUIREMENT_SUMMARY_CHARS),
            state: run.state.as_str().to_string(),
            outcome: run.outcome(),
            created_at: run.created_at,
            completed_at: run.completed_at,
            elapsed_seconds: run.elapsed_seconds(),
            phase_count,
        }
    }

    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            run_id: manifest.run_id,
            requirement: summarize(&manifest.requirement, REQUIREMENT_SUMMARY_CHARS),
            state: manifest.outcome.state().as_str().to_string(),
            outcome: Some(manifest.outcome),
            created_at: manifest.created_at,
            completed_at: Some(manifest.completed_at),
            elapsed_seconds: Some(manifest.elapsed_seconds),
            phase_count: manifest.phases_run(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::phase::PhaseDefinition;
    use crate::run::RunState;

    fn topology() -> PipelineTopology {
        PipelineTopology::new(vec![
            PhaseDefinition::new("a", "A", "x", "a", "md", "m"),
            PhaseDefinition::new("b", "B", "x", "b", "md", "m"),
            PhaseDefinition::new("c", "C", "x", "c", "md", "m"),
        ])
        .unwrap()
    }

    fn result(phase: &str, ordinal: u32, round: u32) -> PhaseResult {
        let now = Utc::now();
        PhaseResult {
            phase: phase.to_string(),
            ordinal,
            round,
            artifact: "body".to_string(),
            artifact_file: format!("{ordinal:02}_{phase}.md"),
            model: "m".to_string(),
            latency_ms: 12,
            attempts: 1,
            verdict: None,
            started_at: now,
            ended_at: now,
        }
    }

    #[test]
    fn test_manifest_fills_failed_and_not_run() {
        let topology = topology();
        let mut run = Run::new("todo");
        run.results.push(result("a", 1, 1));
        run.phases.push(PhaseSummary {
            name: "a".to_string(),
            ordinal: 1,
            title: "A".to_string(),
            agent: "x".to_string(),
            model: "m".to_string(),
            artifact_file: "01_a.md".to_string(),
            rounds: 1,
            status: PhaseStatus::Completed,
            verdict: None,
        });
        run.state = RunState::Failed;
        run.completed_at = Some(Utc::now());
        run.failure = Some(RunFailure {
            phase: "b".to_string(),
            round: 1,
            kind: ErrorKind::GatewayTimeout,
            message: "timed out".to_string(),
        });

        let manifest = Manifest::from_run(&run, &topology);
        let statuses: Vec<_> = manifest.phases.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Completed, PhaseStatus::Failed, PhaseStatus::NotRun]
        );
        assert_eq!(manifest.outcome, RunOutcome::Failed);
        assert_eq!(manifest.results.len(), 1);
        assert_eq!(manifest.results[0].chars, 4);
        assert_eq!(manifest.phases_run(), 1);
    }

    #[test]
    fn test_manifest_marks_partial_phases_of_a_failed_run() {
        // b produced a draft in round 1, then c failed before answering
        let mut run = Run::new("todo");
        run.results.push(result("a", 1, 1));
        run.results.push(result("b", 2, 1));
        run.state = RunState::Failed;
        run.completed_at = Some(Utc::now());
        run.failure = Some(RunFailure {
            phase: "c".to_string(),
            round: 1,
            kind: ErrorKind::GatewayEmptyResponse,
            message: "empty response".to_string(),
        });

        let manifest = Manifest::from_run(&run, &topology());
        let outline: Vec<_> = manifest.phases.iter().map(|p| (p.status, p.rounds)).collect();
        assert_eq!(
            outline,
            vec![
                (PhaseStatus::Failed, 1),
                (PhaseStatus::Failed, 1),
                (PhaseStatus::Failed, 0),
            ]
        );
    }

    #[test]
    fn test_manifest_marks_partial_phases_of_a_cancelled_run() {
        let mut run = Run::new("todo");
        run.results.push(result("a", 1, 1));
        run.state = RunState::Cancelled;
        run.completed_at = Some(Utc::now());

        let manifest = Manifest::from_run(&run, &topology());
        let statuses: Vec<_> = manifest.phases.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Interrupted, PhaseStatus::NotRun, PhaseStatus::NotRun]
        );
        assert_eq!(manifest.outcome, RunOutcome::Cancelled);
        assert_eq!(manifest.phases_run(), 1);
    }

    #[test]
    fn test_summary_from_manifest_truncates_requirement() {
        let mut run = Run::new(&"x".repeat(300));
        run.state = RunState::Succeeded;
        run.completed_at = Some(Utc::now());
        let manifest = Manifest::from_run(&run, &topology());
        let summary = RunSummary::from_manifest(&manifest);

        assert_eq!(summary.requirement.chars().count(), REQUIREMENT_SUMMARY_CHARS);
        assert_eq!(summary.state, "succeeded");
        assert!(summary.is_terminal());
    }

    #[test]
    fn test_summary_from_live_run() {
        let mut run = Run::new("todo");
        run.state = RunState::Running { phase_index: 1 };
        run.results.push(result("a", 1, 1));
        run.results.push(result("b", 2, 1));
        run.results.push(result("b", 2, 2));

        let summary = RunSummary::from_run(&run);
        assert_eq!(summary.state, "running");
        assert_eq!(summary.phase_count, 2);
        assert!(summary.outcome.is_none());
        assert!(!summary.is_terminal());
    }
}
