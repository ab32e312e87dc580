//! Runs one phase for one round: generate, retry once, persist.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;
use crate::gateway::{GenerationGateway, GenerationRequest};
use crate::phase::PhaseDefinition;
use crate::prompt::{PhaseInput, build_messages};
use crate::run::{PhaseResult, RunId};
use crate::store::ArtifactStore;
use crate::util::extract_code_blocks;
use crate::verdict::parse_verdict;

/// One call plus one retry.
const MAX_ATTEMPTS: u32 = 2;

/// Generation parameters shared by every phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    /// Used when a phase has no temperature of its own.
    pub temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            temperature: 0.3,
        }
    }
}

pub struct PhaseExecutor {
    gateway: Arc<dyn GenerationGateway>,
    store: ArtifactStore,
    settings: GenerationSettings,
}

impl PhaseExecutor {
    pub fn new(
        gateway: Arc<dyn GenerationGateway>,
        store: ArtifactStore,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            gateway,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Generate the artifact of `definition` for `round` and write it to the store.
    ///
    /// A gateway error is retried once with the identical request. A second
    /// error becomes `PhaseFailed`. Cancellation observed between the attempts
    /// ends the call with `Cancelled`.
    pub async fn execute(
        &self,
        run_id: RunId,
        definition: &PhaseDefinition,
        input: PhaseInput,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, PipelineError> {
        let request = GenerationRequest {
            model: definition.model.clone(),
            system_prompt: definition.system_prompt.clone(),
            context: build_messages(definition, &input),
            max_tokens: self.settings.max_tokens,
            temperature: definition.temperature.unwrap_or(self.settings.temperature),
        };

        let started_at = Utc::now();
        let start = Instant::now();
        let mut attempts = 0;

        let text = loop {
            attempts += 1;
            match self.gateway.generate(&request).await {
                Ok(text) => break text,
                Err(e) if e.is_retryable() && attempts < MAX_ATTEMPTS => {
                    tracing::warn!(
                        run_id = %run_id,
                        phase = %definition.name,
                        round,
                        error = %e,
                        "Generation failed, retrying once"
                    );
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        run_id = %run_id,
                        phase = %definition.name,
                        round,
                        attempts,
                        error = %e,
                        "Generation failed"
                    );
                    return Err(PipelineError::PhaseFailed {
                        phase: definition.name.clone(),
                        round,
                        source: e,
                    });
                }
            }
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let verdict = definition.is_critic().then(|| parse_verdict(&text));
        let artifact = if definition.extract_code {
            extract_code_blocks(&text)
        } else {
            text
        };

        let artifact_file = definition.artifact_file_name();
        self.store
            .write_artifact(run_id, &artifact_file, &artifact)
            .await?;
        if definition.is_revised() {
            self.store
                .write_artifact(run_id, &definition.round_file_name(round), &artifact)
                .await?;
        }

        tracing::info!(
            run_id = %run_id,
            phase = %definition.name,
            round,
            attempts,
            latency_ms,
            chars = artifact.len(),
            verdict = verdict.map(|v| v.as_str()),
            "Phase produced artifact"
        );

        Ok(PhaseResult {
            phase: definition.name.clone(),
            ordinal: definition.ordinal,
            round,
            artifact,
            artifact_file,
            model: definition.model.clone(),
            latency_ms,
            attempts,
            verdict,
            started_at,
            ended_at: Utc::now(),
        })
    }
}
