//! `pipewright serve`

use anyhow::Result;
use std::sync::Arc;

use pipewright::config::PipewrightConfig;
use pipewright::server::{ServerConfig, start_server};
use pipewright::service::PipelineService;

pub async fn cmd_serve(config: &PipewrightConfig, cors: bool) -> Result<()> {
    let service = Arc::new(PipelineService::from_config(config)?);
    tracing::info!(
        gateway = %config.toml.gateway.base_url,
        output_dir = %config.output_dir().display(),
        phases = service.topology().len(),
        "Starting server"
    );

    let server = ServerConfig {
        bind: config.toml.server.bind.clone(),
        port: config.toml.server.port,
        permissive_cors: cors,
    };
    start_server(service, server).await
}
