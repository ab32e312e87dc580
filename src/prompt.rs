//! Conversation context assembly for a phase invocation.
//!
//! Every phase sees the requirement followed by the artifacts of the phases
//! before it, in pipeline order. A producer in a later revision round also sees
//! its previous draft and the reviewer's feedback.

use crate::gateway::ChatMessage;
use crate::phase::PhaseDefinition;

/// Canonical artifact of an earlier phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorArtifact {
    pub phase: String,
    pub title: String,
    pub content: String,
}

/// Feedback carried into the next producer round.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionFeedback {
    pub previous_draft: String,
    pub review: String,
}

/// Input of one phase invocation. Built fresh for every call and passed by value.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseInput {
    pub requirement: String,
    pub prior: Vec<PriorArtifact>,
    pub revision: Option<RevisionFeedback>,
}

impl PhaseInput {
    pub fn new(requirement: &str, prior: Vec<PriorArtifact>) -> Self {
        Self {
            requirement: requirement.to_string(),
            prior,
            revision: None,
        }
    }

    pub fn with_revision(mut self, previous_draft: &str, review: &str) -> Self {
        self.revision = Some(RevisionFeedback {
            previous_draft: previous_draft.to_string(),
            review: review.to_string(),
        });
        self
    }
}

/// Build the ordered context messages for `definition`.
pub fn build_messages(definition: &PhaseDefinition, input: &PhaseInput) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(input.prior.len() + 3);

    messages.push(ChatMessage::user(format!(
        "## Requirement\n\n{}",
        input.requirement.trim()
    )));

    for artifact in &input.prior {
        messages.push(ChatMessage::user(format!(
            "## {} ({})\n\n{}",
            artifact.title, artifact.phase, artifact.content
        )));
    }

    match &input.revision {
        Some(feedback) => {
            messages.push(ChatMessage::assistant(feedback.previous_draft.clone()));
            messages.push(ChatMessage::user(format!(
                "## Reviewer feedback\n\n{}\n\nRevise your previous output to address every \
                 point above. Return the complete {} again, not a diff.",
                feedback.review.trim(),
                definition.artifact
            )));
        }
        None => messages.push(ChatMessage::user(instruction(definition))),
    }

    messages
}

fn instruction(definition: &PhaseDefinition) -> String {
    let mut text = format!(
        "You are the {}. Produce the {} for the requirement above.",
        definition.agent,
        definition.title.to_lowercase()
    );
    if definition.extract_code {
        text.push_str(" Put the complete code in a single fenced code block.");
    }
    if definition.is_critic() {
        text.push_str(
            " State your decision on its own line as 'Verdict: APPROVED' or \
             'Verdict: NEEDS_REVISION'.",
        );
    }
    text
}
