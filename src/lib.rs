//! Phase pipeline engine for LLM agents.
//!
//! A requirement goes through an ordered list of phases, each produced by one
//! generation call. Producer/critic pairs loop until the critic approves or the
//! round budget runs out. Every step is published as an ordered event stream and
//! every artifact is written under the run's output directory.

pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod logging;
pub mod phase;
pub mod prompt;
pub mod registry;
pub mod revision;
pub mod run;
pub mod sequencer;
pub mod server;
pub mod service;
pub mod store;
pub mod util;
pub mod verdict;

pub use errors::{ErrorKind, GatewayError, PipelineError, StoreError};
pub use events::{Event, EventKind, Subscription};
pub use gateway::{GenerationGateway, GenerationRequest};
pub use phase::{PhaseDefinition, PipelineTopology};
pub use run::{Run, RunId, RunOutcome, RunState};
pub use service::{PipelineService, ServiceOptions};
