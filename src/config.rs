//! Configuration for pipewright.
//!
//! Settings are read from `.pipewright/pipewright.toml` and layered:
//! file → environment → CLI. Every field has a default, so a missing file is
//! a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [gateway]
//! base_url = "http://localhost:11434"
//! timeout_secs = 600
//! max_tokens = 8192
//! temperature = 0.3
//!
//! [pipeline]
//! review_max_rounds = 3
//! phases_file = ".pipewright/phases.json"
//! chunk_size = 4000
//!
//! [models]
//! code_review = "llama3.1:8b"
//!
//! [storage]
//! output_dir = ".pipewright/runs"
//!
//! [server]
//! bind = "127.0.0.1"
//! port = 5000
//!
//! [registry]
//! max_retained_runs = 200
//! pending_ttl_secs = 3600
//!
//! [logging]
//! log_dir = ".pipewright/logs"
//! format = "compact"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::GenerationSettings;
use crate::phase::PipelineTopology;

pub const CONFIG_DIR: &str = ".pipewright";
pub const CONFIG_FILE: &str = "pipewright.toml";

pub const ENV_GATEWAY_URL: &str = "PIPEWRIGHT_GATEWAY_URL";
pub const ENV_API_KEY: &str = "PIPEWRIGHT_API_KEY";
pub const ENV_OUTPUT_DIR: &str = "PIPEWRIGHT_OUTPUT_DIR";
pub const ENV_PORT: &str = "PIPEWRIGHT_PORT";

/// Generation backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token for hosted OpenAI-compatible APIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.3
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Pipeline shape and streaming settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Round budget of every producer/critic pair
    #[serde(default = "default_review_max_rounds")]
    pub review_max_rounds: u32,
    /// Custom `phases.json`; the built-in pipeline is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases_file: Option<PathBuf>,
    /// Characters per `phase_chunk` event
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_review_max_rounds() -> u32 {
    crate::phase::DEFAULT_MAX_ROUNDS
}

fn default_chunk_size() -> usize {
    crate::sequencer::DEFAULT_CHUNK_SIZE
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            review_max_rounds: default_review_max_rounds(),
            phases_file: None,
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("runs")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySection {
    /// Finished runs kept in memory; older ones are served from disk
    #[serde(default = "default_max_retained_runs")]
    pub max_retained_runs: usize,
    /// Seconds a registered run may wait for `start` before it is dropped
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

fn default_max_retained_runs() -> usize {
    crate::registry::DEFAULT_MAX_RETAINED_RUNS
}

fn default_pending_ttl_secs() -> u64 {
    crate::registry::DEFAULT_PENDING_TTL.as_secs()
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            max_retained_runs: default_max_retained_runs(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Also write daily-rotated log files here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
}

/// The complete pipewright.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipewrightToml {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Model overrides keyed by phase name
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PipewrightToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipewright.toml")
    }

    /// Load from `<config_dir>/pipewright.toml`, or defaults if the file is missing.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipewright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_GATEWAY_URL).filter(|v| !v.trim().is_empty()) {
            self.gateway.base_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.gateway.api_key = Some(key);
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            self.storage.output_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_PORT} value '{port}'"))?;
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Validate the configuration and return a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.gateway.base_url.starts_with("http://")
            && !self.gateway.base_url.starts_with("https://")
        {
            errors.push(format!(
                "gateway.base_url must start with http:// or https://, got '{}'",
                self.gateway.base_url
            ));
        }
        if self.gateway.timeout_secs == 0 {
            errors.push("gateway.timeout_secs must be at least 1".to_string());
        }
        if self.gateway.max_tokens == 0 {
            errors.push("gateway.max_tokens must be at least 1".to_string());
        }
        if !(0.0..=2.0).contains(&self.gateway.temperature) {
            errors.push(format!(
                "gateway.temperature must be between 0.0 and 2.0, got {}",
                self.gateway.temperature
            ));
        }
        if self.pipeline.review_max_rounds == 0 {
            errors.push("pipeline.review_max_rounds must be at least 1".to_string());
        }
        if self.pipeline.chunk_size == 0 {
            errors.push("pipeline.chunk_size must be at least 1".to_string());
        }
        if self.registry.max_retained_runs == 0 {
            errors.push("registry.max_retained_runs must be at least 1".to_string());
        }

        errors
    }
}

/// Values given on the command line. `None` keeps the file/env value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub gateway_url: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_rounds: Option<u32>,
    pub log_format: Option<LogFormat>,
}

/// Resolved configuration: file → environment → CLI.
#[derive(Debug, Clone)]
pub struct PipewrightConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: PipewrightToml,
}

impl PipewrightConfig {
    /// Load file and environment layers for `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = PipewrightToml::load_or_default(&config_dir)?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    /// Build directly from an already-parsed file, without touching the environment.
    pub fn from_toml(project_dir: PathBuf, toml: PipewrightToml) -> Self {
        let config_dir = project_dir.join(CONFIG_DIR);
        Self {
            project_dir,
            config_dir,
            toml,
        }
    }

    /// Apply the CLI layer.
    pub fn with_cli(mut self, cli: CliOverrides) -> Self {
        if let Some(url) = cli.gateway_url {
            self.toml.gateway.base_url = url;
        }
        if let Some(dir) = cli.output_dir {
            self.toml.storage.output_dir = dir;
        }
        if let Some(bind) = cli.bind {
            self.toml.server.bind = bind;
        }
        if let Some(port) = cli.port {
            self.toml.server.port = port;
        }
        if let Some(rounds) = cli.max_rounds {
            self.toml.pipeline.review_max_rounds = rounds;
        }
        if let Some(format) = cli.log_format {
            self.toml.logging.format = format;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.toml.storage.output_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.log_dir.as_deref().map(|p| self.resolve(p))
    }

    pub fn phases_file(&self) -> Option<PathBuf> {
        self.toml.pipeline.phases_file.as_deref().map(|p| self.resolve(p))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.gateway.timeout_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.toml.registry.pending_ttl_secs)
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            max_tokens: self.toml.gateway.max_tokens,
            temperature: self.toml.gateway.temperature,
        }
    }

    /// The pipeline to run: `phases_file` or the built-in one, with round
    /// budget and model overrides applied.
    pub fn topology(&self) -> Result<PipelineTopology> {
        let topology = match self.phases_file() {
            Some(path) => PipelineTopology::from_file(&path)?,
            None => PipelineTopology::default_pipeline(),
        };
        let topology = topology
            .with_max_rounds(self.toml.pipeline.review_max_rounds)
            .context("Invalid pipeline.review_max_rounds")?;
        Ok(topology.with_models(&self.toml.models))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let toml = PipewrightToml::default();
        assert_eq!(toml.gateway.base_url, "http://localhost:11434");
        assert_eq!(toml.gateway.timeout_secs, 600);
        assert_eq!(toml.gateway.max_tokens, 8192);
        assert!((toml.gateway.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(toml.pipeline.review_max_rounds, 3);
        assert_eq!(toml.pipeline.chunk_size, 4000);
        assert_eq!(toml.server.port, 5000);
        assert_eq!(toml.registry.max_retained_runs, 200);
        assert_eq!(toml.registry.pending_ttl_secs, 3600);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let toml = PipewrightToml::parse(
            r#"
[gateway]
base_url = "http://gpu-box:8000"

[pipeline]
review_max_rounds = 5

[models]
code_review = "llama3.1:8b"
"#,
        )
        .unwrap();
        assert_eq!(toml.gateway.base_url, "http://gpu-box:8000");
        assert_eq!(toml.gateway.timeout_secs, 600);
        assert_eq!(toml.pipeline.review_max_rounds, 5);
        assert_eq!(toml.models["code_review"], "llama3.1:8b");
        assert_eq!(toml.server.port, 5000);
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        assert!(PipewrightToml::parse("[server]\nport = \"high\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = PipewrightToml::parse("[server]\nport = 6000").unwrap();
        toml.apply_env_with(env(&[
            (ENV_PORT, "7000"),
            (ENV_GATEWAY_URL, "http://remote:11434"),
            (ENV_OUTPUT_DIR, "/tmp/out"),
        ]))
        .unwrap();
        assert_eq!(toml.server.port, 7000);
        assert_eq!(toml.gateway.base_url, "http://remote:11434");
        assert_eq!(toml.storage.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_env_invalid_port_is_error() {
        let mut toml = PipewrightToml::default();
        let err = toml.apply_env_with(env(&[(ENV_PORT, "abc")])).unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let dir = TempDir::new().unwrap();
        let mut toml = PipewrightToml::parse("[server]\nport = 6000").unwrap();
        toml.apply_env_with(env(&[(ENV_PORT, "7000")])).unwrap();

        let config = PipewrightConfig::from_toml(dir.path().to_path_buf(), toml).with_cli(
            CliOverrides {
                port: Some(8000),
                max_rounds: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(config.toml.server.port, 8000);
        assert_eq!(config.toml.pipeline.review_max_rounds, 2);
    }

    #[test]
    fn test_relative_paths_resolve_against_project() {
        let dir = TempDir::new().unwrap();
        let config = PipewrightConfig::from_toml(dir.path().to_path_buf(), PipewrightToml::default());
        assert_eq!(config.output_dir(), dir.path().join(".pipewright").join("runs"));
        assert!(config.log_dir().is_none());

        let config = config.with_cli(CliOverrides {
            output_dir: Some(PathBuf::from("/abs/out")),
            ..Default::default()
        });
        assert_eq!(config.output_dir(), PathBuf::from("/abs/out"));
    }

    #[test]
    fn test_topology_applies_overrides() {
        let dir = TempDir::new().unwrap();
        let mut toml = PipewrightToml::default();
        toml.pipeline.review_max_rounds = 4;
        toml.models
            .insert("documentation".to_string(), "mistral:7b".to_string());
        let config = PipewrightConfig::from_toml(dir.path().to_path_buf(), toml);

        let topology = config.topology().unwrap();
        assert_eq!(topology.get("documentation").unwrap().model, "mistral:7b");
        assert!(matches!(
            topology.steps()[1],
            crate::phase::Step::Revision { max_rounds: 4, .. }
        ));
    }

    #[test]
    fn test_validate_catches_bad_values() {
        let mut toml = PipewrightToml::default();
        toml.gateway.base_url = "localhost:11434".to_string();
        toml.gateway.temperature = 3.0;
        toml.pipeline.review_max_rounds = 0;
        let errors = toml.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_rejects_zero_retained_runs() {
        let mut toml = PipewrightToml::default();
        toml.registry.max_retained_runs = 0;
        assert_eq!(
            toml.validate(),
            vec!["registry.max_retained_runs must be at least 1".to_string()]
        );

        toml.registry.max_retained_runs = 1;
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_registry_section() {
        let toml = PipewrightToml::parse("[registry]\nmax_retained_runs = 5\npending_ttl_secs = 60\n").unwrap();
        assert_eq!(toml.registry.max_retained_runs, 5);
        assert_eq!(toml.registry.pending_ttl_secs, 60);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = PipewrightToml::default();
        toml.server.port = 5050;
        toml.save(&path).unwrap();

        let loaded = PipewrightToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, toml);
    }
}
