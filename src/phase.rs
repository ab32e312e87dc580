//! Phase definitions and pipeline topology.
//!
//! This module provides:
//! - `PhaseDefinition`, the static description of one pipeline phase
//! - `PhasesFile` for loading a custom pipeline from `phases.json`
//! - `PipelineTopology`, the validated, ordered list of execution steps
//! - The built-in seven-phase software delivery pipeline

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::errors::PipelineError;

/// Default round budget for a producer/critic pair.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// How a phase takes part in the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseRole {
    /// Runs once.
    #[default]
    Plain,
    /// Produces an artifact that the named critic reviews, for up to `max_rounds`.
    Producer { critic: String, max_rounds: u32 },
    /// Reviews the preceding producer's artifact and answers with a verdict.
    Critic,
}

/// Static configuration of one phase. Immutable once the topology is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Machine name, e.g. `code_generation`
    pub name: String,
    /// Display name, e.g. `Code Generation`
    pub title: String,
    /// Agent persona running this phase
    pub agent: String,
    /// 1-based position, assigned by the topology
    #[serde(default)]
    pub ordinal: u32,
    /// Artifact file stem, e.g. `code`
    pub artifact: String,
    /// Artifact file extension, e.g. `py`
    pub extension: String,
    /// Keep only fenced code blocks from the generated text
    #[serde(default)]
    pub extract_code: bool,
    /// Model selector passed to the generation gateway
    pub model: String,
    /// Per-phase temperature; falls back to the gateway default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub role: PhaseRole,
}

impl PhaseDefinition {
    pub fn new(name: &str, title: &str, agent: &str, artifact: &str, extension: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            agent: agent.to_string(),
            ordinal: 0,
            artifact: artifact.to_string(),
            extension: extension.to_string(),
            extract_code: false,
            model: model.to_string(),
            temperature: None,
            system_prompt: String::new(),
            role: PhaseRole::Plain,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    pub fn with_extract_code(mut self, extract: bool) -> Self {
        self.extract_code = extract;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Mark this phase as the producer of a revision pair.
    pub fn producer_for(mut self, critic: &str, max_rounds: u32) -> Self {
        self.role = PhaseRole::Producer {
            critic: critic.to_string(),
            max_rounds,
        };
        self
    }

    /// Mark this phase as a critic.
    pub fn critic(mut self) -> Self {
        self.role = PhaseRole::Critic;
        self
    }

    pub fn is_critic(&self) -> bool {
        matches!(self.role, PhaseRole::Critic)
    }

    /// True for both halves of a revision pair.
    pub fn is_revised(&self) -> bool {
        !matches!(self.role, PhaseRole::Plain)
    }

    /// Canonical artifact file name, e.g. `02_code.py`.
    pub fn artifact_file_name(&self) -> String {
        format!("{:02}_{}.{}", self.ordinal, self.artifact, self.extension)
    }

    /// Per-round copy kept for revised phases, e.g. `rounds/02_code.r2.py`.
    pub fn round_file_name(&self, round: u32) -> String {
        format!(
            "rounds/{:02}_{}.r{}.{}",
            self.ordinal, self.artifact, round, self.extension
        )
    }
}

/// The `phases.json` file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesFile {
    pub phases: Vec<PhaseDefinition>,
}

impl PhasesFile {
    /// Load phases from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;

        let phases_file: PhasesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phases JSON: {}", path.display()))?;

        Ok(phases_file)
    }

    /// Save phases to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize phases to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write phases file: {}", path.display()))?;

        Ok(())
    }
}

/// One unit of sequential work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Index of a plain phase.
    Single(usize),
    /// Indices of a producer and the critic right after it.
    Revision {
        producer: usize,
        critic: usize,
        max_rounds: u32,
    },
}

/// Validated, ordered pipeline. Built once per process and shared.
#[derive(Debug, Clone)]
pub struct PipelineTopology {
    phases: Vec<PhaseDefinition>,
    steps: Vec<Step>,
}

impl PipelineTopology {
    /// Validate phase definitions and assign ordinals.
    ///
    /// Rules: at least one phase, unique names, every producer immediately
    /// followed by the critic it names, every critic immediately preceded by its
    /// producer, round budgets of at least one.
    pub fn new(mut phases: Vec<PhaseDefinition>) -> Result<Self, PipelineError> {
        if phases.is_empty() {
            return Err(PipelineError::InvalidTopology(
                "pipeline has no phases".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for phase in &phases {
            if phase.name.trim().is_empty() {
                return Err(PipelineError::InvalidTopology(
                    "phase with empty name".to_string(),
                ));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(PipelineError::InvalidTopology(format!(
                    "duplicate phase name '{}'",
                    phase.name
                )));
            }
        }

        for (i, phase) in phases.iter_mut().enumerate() {
            phase.ordinal = (i + 1) as u32;
        }

        let mut steps = Vec::new();
        let mut i = 0;
        while i < phases.len() {
            match &phases[i].role {
                PhaseRole::Plain => {
                    steps.push(Step::Single(i));
                    i += 1;
                }
                PhaseRole::Producer { critic, max_rounds } => {
                    let next = phases.get(i + 1);
                    let pairs = next.is_some_and(|n| &n.name == critic && n.is_critic());
                    if !pairs {
                        return Err(PipelineError::InvalidTopology(format!(
                            "producer '{}' must be immediately followed by its critic '{}'",
                            phases[i].name, critic
                        )));
                    }
                    if *max_rounds == 0 {
                        return Err(PipelineError::InvalidTopology(format!(
                            "producer '{}' needs a round budget of at least 1",
                            phases[i].name
                        )));
                    }
                    steps.push(Step::Revision {
                        producer: i,
                        critic: i + 1,
                        max_rounds: *max_rounds,
                    });
                    i += 2;
                }
                PhaseRole::Critic => {
                    return Err(PipelineError::InvalidTopology(format!(
                        "critic '{}' is not preceded by a producer naming it",
                        phases[i].name
                    )));
                }
            }
        }

        Ok(Self { phases, steps })
    }

    /// The built-in software delivery pipeline.
    pub fn default_pipeline() -> Self {
        // The default definitions satisfy every validation rule.
        match Self::new(default_phases()) {
            Ok(topology) => topology,
            Err(e) => unreachable!("built-in pipeline is invalid: {e}"),
        }
    }

    /// Load from a `phases.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = PhasesFile::load(path)?;
        Self::new(file.phases).with_context(|| format!("Invalid pipeline in {}", path.display()))
    }

    /// Override the round budget of every revision pair.
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Result<Self, PipelineError> {
        if max_rounds == 0 {
            return Err(PipelineError::InvalidTopology(
                "round budget must be at least 1".to_string(),
            ));
        }
        for phase in &mut self.phases {
            if let PhaseRole::Producer { max_rounds: r, .. } = &mut phase.role {
                *r = max_rounds;
            }
        }
        for step in &mut self.steps {
            if let Step::Revision { max_rounds: r, .. } = step {
                *r = max_rounds;
            }
        }
        Ok(self)
    }

    /// Override model selectors by phase name. Unknown names are ignored.
    pub fn with_models(mut self, models: &HashMap<String, String>) -> Self {
        for phase in &mut self.phases {
            if let Some(model) = models.get(&phase.name) {
                phase.model = model.clone();
            }
        }
        self
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn phase(&self, index: usize) -> &PhaseDefinition {
        &self.phases[index]
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// The seven phases of the default pipeline: requirements, code with an
/// iterative review, tests, documentation, deployment configuration, UI.
pub fn default_phases() -> Vec<PhaseDefinition> {
    const PLANNER: &str = "gpt-oss:20b";
    const CODER: &str = "qwen3-coder:30b";
    const REVIEWER: &str = "devstral-small-2:24b";

    vec![
        PhaseDefinition::new(
            "requirement_analysis",
            "Requirement Analysis",
            "Requirement Analyst",
            "specification",
            "md",
            PLANNER,
        )
        .with_system_prompt(
            "You are a requirement analyst. Turn the user's description into a structured \
             specification: title, overview, functional requirements, non-functional \
             requirements, data model, edge cases and acceptance criteria.",
        ),
        PhaseDefinition::new(
            "code_generation",
            "Code Generation",
            "Senior Developer",
            "code",
            "py",
            CODER,
        )
        .with_system_prompt(
            "You are a senior developer. Implement the specification as complete, runnable \
             code in a single fenced code block. When given review feedback, return the full \
             revised code.",
        )
        .with_extract_code(true)
        .with_temperature(0.2)
        .producer_for("code_review", DEFAULT_MAX_ROUNDS),
        PhaseDefinition::new(
            "code_review",
            "Code Review",
            "Code Reviewer",
            "review",
            "md",
            REVIEWER,
        )
        .with_system_prompt(
            "You are a code reviewer. Check the code against the specification for \
             correctness, security and edge cases. Start your answer with a line \
             'Verdict: APPROVED' or 'Verdict: NEEDS_REVISION', then list concrete issues \
             and fixes.",
        )
        .critic(),
        PhaseDefinition::new(
            "test_generation",
            "Test Generation",
            "QA Engineer",
            "tests",
            "py",
            CODER,
        )
        .with_system_prompt(
            "You are a QA engineer. Write an automated test suite for the code covering the \
             acceptance criteria and edge cases. Reply with one fenced code block.",
        )
        .with_extract_code(true)
        .with_temperature(0.2),
        PhaseDefinition::new(
            "documentation",
            "Documentation",
            "Tech Writer",
            "documentation",
            "md",
            PLANNER,
        )
        .with_system_prompt(
            "You are a technical writer. Produce user and developer documentation for the \
             code: installation, usage, configuration and API reference.",
        ),
        PhaseDefinition::new(
            "devops_configuration",
            "DevOps Configuration",
            "DevOps Agent",
            "devops",
            "md",
            PLANNER,
        )
        .with_system_prompt(
            "You are a DevOps engineer. Provide a Dockerfile, a CI workflow and deployment \
             notes for the code.",
        ),
        PhaseDefinition::new("ui_design", "UI Design", "UI Designer", "ui_app", "py", PLANNER)
            .with_system_prompt(
                "You are a UI designer. Build a simple web UI for the application in a single \
                 fenced code block.",
            )
            .with_extract_code(true),
    ]
}
