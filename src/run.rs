//! Run data model: identifiers, the run state machine and per-phase results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::ErrorKind;
use crate::verdict::Verdict;

/// Opaque run identifier. A fresh v4 UUID per run, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a run.
///
/// `Pending → Running → (Succeeded | Failed | Cancelled)`. The three terminal
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    /// `phase_index` is the position of the phase definition currently executing.
    Running { phase_index: usize },
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            Self::Succeeded => Some(RunOutcome::Succeeded),
            Self::Failed => Some(RunOutcome::Failed),
            Self::Cancelled => Some(RunOutcome::Cancelled),
            Self::Pending | Self::Running { .. } => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn state(&self) -> RunState {
        match self {
            Self::Succeeded => RunState::Succeeded,
            Self::Failed => RunState::Failed,
            Self::Cancelled => RunState::Cancelled,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one generation call for one phase and round. Never mutated once
/// appended to a run; a correction is a new result with a higher round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseResult {
    pub phase: String,
    pub ordinal: u32,
    pub round: u32,
    pub artifact: String,
    pub artifact_file: String,
    pub model: String,
    pub latency_ms: u64,
    /// Gateway attempts used: 1, or 2 when the single retry was needed.
    pub attempts: u32,
    /// Set for critic phases only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Why a run failed: the responsible phase/round and the error kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailure {
    pub phase: String,
    pub round: u32,
    pub kind: ErrorKind,
    pub message: String,
}

/// Final status of a phase as recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Plain phase finished.
    Completed,
    /// Revision pair ended with the critic approving.
    Approved,
    /// Revision pair ran out of rounds without approval.
    ApprovedWithReservations,
    Failed,
    /// Produced output but was cut short by cancellation.
    Interrupted,
    NotRun,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Approved => "approved",
            Self::ApprovedWithReservations => "approved_with_reservations",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::NotRun => "not_run",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase summary line of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSummary {
    pub name: String,
    pub ordinal: u32,
    pub title: String,
    pub agent: String,
    pub model: String,
    pub artifact_file: String,
    pub rounds: u32,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

/// A pipeline run as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub requirement: String,
    pub state: RunState,
    pub results: Vec<PhaseResult>,
    /// Final status of every phase that reached a conclusion, in pipeline order.
    pub phases: Vec<PhaseSummary>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl Run {
    pub fn new(requirement: &str) -> Self {
        Self {
            id: RunId::new(),
            requirement: requirement.to_string(),
            state: RunState::Pending,
            results: Vec::new(),
            phases: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure: None,
        }
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.state.outcome()
    }

    /// All results recorded for one phase, in round order.
    pub fn results_for<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a PhaseResult> + 'a {
        self.results.iter().filter(move |r| r.phase == phase)
    }

    /// Number of rounds recorded for a phase.
    pub fn rounds_for(&self, phase: &str) -> u32 {
        self.results_for(phase).map(|r| r.round).max().unwrap_or(0)
    }

    /// Wall-clock seconds from start (or creation) to completion.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.created_at);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(phase: &str, round: u32) -> PhaseResult {
        let now = Utc::now();
        PhaseResult {
            phase: phase.to_string(),
            ordinal: 1,
            round,
            artifact: String::new(),
            artifact_file: "01_x.md".to_string(),
            model: "m".to_string(),
            latency_ms: 0,
            attempts: 1,
            verdict: None,
            started_at: now,
            ended_at: now,
        }
    }

    #[test]
    fn run_id_round_trips_through_display() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn run_ids_are_unique() {
        let ids: std::collections::HashSet<RunId> = (0..1000).map(|_| RunId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Running { phase_index: 3 }.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert_eq!(RunOutcome::Cancelled.state(), RunState::Cancelled);
    }

    #[test]
    fn run_state_serializes_with_phase_index() {
        let json = serde_json::to_string(&RunState::Running { phase_index: 2 }).unwrap();
        assert_eq!(json, r#"{"state":"running","phase_index":2}"#);
        let json = serde_json::to_string(&RunState::Succeeded).unwrap();
        assert_eq!(json, r#"{"state":"succeeded"}"#);
    }

    #[test]
    fn rounds_for_counts_highest_round() {
        let mut run = Run::new("build a todo app");
        run.results.push(result("a", 1));
        run.results.push(result("b", 1));
        run.results.push(result("b", 2));
        assert_eq!(run.rounds_for("a"), 1);
        assert_eq!(run.rounds_for("b"), 2);
        assert_eq!(run.rounds_for("c"), 0);
    }

    #[test]
    fn phase_status_uses_manifest_vocabulary() {
        let json = serde_json::to_string(&PhaseStatus::ApprovedWithReservations).unwrap();
        assert_eq!(json, "\"approved_with_reservations\"");
        assert_eq!(PhaseStatus::NotRun.to_string(), "not_run");
        assert_eq!(PhaseStatus::Interrupted.to_string(), "interrupted");
    }
}
