use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pipewright::config::{CliOverrides, LogFormat, PipewrightConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about = "Phase pipeline engine for LLM agents")]
pub struct Cli {
    /// Project directory holding `.pipewright/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible generation backend
    #[arg(long, global = true)]
    pub gateway_url: Option<String>,

    /// Where run directories are written
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API, SSE streams and the WebSocket feed
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Allow cross-origin requests
        #[arg(long)]
        cors: bool,
    },
    /// Run the pipeline for one requirement and print its events
    Run {
        /// What to build
        requirement: Option<String>,

        /// Read the requirement from a file instead
        #[arg(short, long, conflicts_with = "requirement")]
        file: Option<PathBuf>,

        /// Round budget of every producer/critic pair
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Also print generated text as it arrives
        #[arg(long)]
        stream: bool,
    },
    /// List past and current runs, newest first
    History {
        /// Show at most this many runs
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one run, or one of its artifacts
    Show {
        run_id: String,

        /// Print the content of this artifact file
        #[arg(short, long)]
        artifact: Option<String>,
    },
    /// Show the pipeline phases
    Phases,
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
    /// Write a default pipewright.toml
    Init,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let mut overrides = CliOverrides {
            gateway_url: self.gateway_url.clone(),
            output_dir: self.output_dir.clone(),
            log_format: self.log_format,
            ..Default::default()
        };
        match &self.command {
            Commands::Serve { port, bind, .. } => {
                overrides.port = *port;
                overrides.bind = bind.clone();
            }
            Commands::Run { max_rounds, .. } => overrides.max_rounds = *max_rounds,
            _ => {}
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work even when the file is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = PipewrightConfig::new(project_dir)?.with_cli(cli.overrides());
    let log_dir = config.log_dir();
    let _log_guard = pipewright::logging::init(config.toml.logging.format, log_dir.as_deref())?;

    match &cli.command {
        Commands::Serve { cors, .. } => cmd::cmd_serve(&config, *cors).await?,
        Commands::Run {
            requirement,
            file,
            stream,
            ..
        } => {
            let requirement = cmd::read_requirement(requirement.as_deref(), file.as_deref())?;
            cmd::cmd_run(&config, &requirement, *stream).await?;
        }
        Commands::History { limit } => cmd::cmd_history(&config, *limit).await?,
        Commands::Show { run_id, artifact } => {
            cmd::cmd_show(&config, run_id, artifact.as_deref()).await?
        }
        Commands::Phases => cmd::cmd_phases(&config)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
