//! Configuration view and validation commands: `pipewright config`.

use anyhow::Result;
use std::path::Path;

use pipewright::config::{CONFIG_DIR, CONFIG_FILE, PipewrightConfig, PipewrightToml};

use super::super::ConfigCommands;

fn print_effective(toml: &PipewrightToml) -> Result<()> {
    let mut shown = toml.clone();
    if shown.gateway.api_key.is_some() {
        shown.gateway.api_key = Some("********".to_string());
    }
    let rendered = toml::to_string_pretty(&shown)?;
    for line in rendered.lines() {
        println!("  {}", line);
    }
    Ok(())
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Pipewright Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Run 'pipewright config init' to create one.");
            }
            println!();

            println!("Effective values (with env overrides):");
            let config = PipewrightConfig::new(project_dir.to_path_buf())?;
            print_effective(&config.toml)?;
            println!();
            println!("  output_dir resolves to {}", config.output_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = PipewrightConfig::new(project_dir.to_path_buf())?;
            let mut problems = config.validate();
            if let Err(e) = config.topology() {
                problems.push(format!("pipeline: {:#}", e));
            }

            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)?;
            PipewrightToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [gateway] base_url, timeout_secs, max_tokens, temperature");
            println!("  - [pipeline] review_max_rounds, phases_file, chunk_size");
            println!("  - [models] per-phase model overrides");
            println!("  - [storage] output_dir, [server] bind/port");
            println!();
        }
    }

    Ok(())
}
