//! Shared helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use pipewright::errors::GatewayError;
use pipewright::gateway::{ChatRole, GenerationGateway, GenerationRequest};
use pipewright::phase::{PhaseDefinition, PipelineTopology};
use pipewright::service::{PipelineService, ServiceOptions};

pub const MODEL_A: &str = "model-a";
pub const MODEL_B: &str = "model-b";
pub const MODEL_C: &str = "model-c";
pub const MODEL_D: &str = "model-d";

/// Gateway answering from per-model scripts.
///
/// Each model has a queue of responses; once it is empty the gateway answers
/// `"<model> output"`. When built with `held()`, every call waits for a permit
/// handed out through `release`.
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, GatewayError>>>>,
    calls: Mutex<Vec<GenerationRequest>>,
    gate: Option<Semaphore>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// A gateway whose calls block until released.
    pub fn held() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn script(self, model: &str, responses: Vec<Result<String, GatewayError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .extend(responses);
        self
    }

    pub fn reply(self, model: &str, texts: &[&str]) -> Self {
        self.script(model, texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    /// Let `n` more calls through a held gateway.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, model: &str) -> Vec<GenerationRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.model == model)
            .collect()
    }

    /// Wait until at least `n` calls have arrived.
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("gateway calls did not arrive in time");
    }
}

#[async_trait]
impl GenerationGateway for ScriptedGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GatewayError> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| GatewayError::Unavailable(e.to_string()))?
                .forget();
        }

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.model)
            .and_then(|queue| queue.pop_front());
        next.unwrap_or_else(|| Ok(format!("{} output", request.model)))
    }
}

/// All user and assistant text of a request, joined.
pub fn context_text(request: &GenerationRequest) -> String {
    request
        .context
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn assistant_messages(request: &GenerationRequest) -> Vec<String> {
    request
        .context
        .iter()
        .filter(|m| m.role == ChatRole::Assistant)
        .map(|m| m.content.clone())
        .collect()
}

/// A plain, a producer/critic pair with `max_rounds`, another plain.
pub fn abcd_topology(max_rounds: u32) -> PipelineTopology {
    PipelineTopology::new(vec![
        PhaseDefinition::new("a", "Phase A", "Analyst", "a", "md", MODEL_A),
        PhaseDefinition::new("b", "Phase B", "Engineer", "b", "py", MODEL_B)
            .producer_for("c", max_rounds),
        PhaseDefinition::new("c", "Phase C", "Reviewer", "c", "md", MODEL_C).critic(),
        PhaseDefinition::new("d", "Phase D", "Tester", "d", "py", MODEL_D),
    ])
    .unwrap()
}

pub fn service(gateway: Arc<ScriptedGateway>, topology: PipelineTopology, dir: &Path) -> PipelineService {
    let mut options = ServiceOptions::new(dir);
    options.chunk_size = 16;
    PipelineService::new(gateway, topology, options)
}
