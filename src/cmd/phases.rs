//! `pipewright phases`: print the pipeline.

use anyhow::Result;
use console::style;

use pipewright::config::PipewrightConfig;
use pipewright::phase::PhaseRole;

pub fn cmd_phases(config: &PipewrightConfig) -> Result<()> {
    let topology = config.topology()?;

    println!();
    match config.phases_file() {
        Some(path) => println!("Phases loaded from: {}", path.display()),
        None => println!("Built-in pipeline"),
    }
    println!();
    println!(
        "{:<3} {:<22} {:<20} {:<22} {:<22} Role",
        "#", "Phase", "Agent", "Model", "Artifact"
    );
    println!(
        "{:<3} {:<22} {:<20} {:<22} {:<22} ----",
        "-", "-----", "-----", "-----", "--------"
    );

    for phase in topology.phases() {
        let role = match &phase.role {
            PhaseRole::Plain => String::new(),
            PhaseRole::Producer { critic, max_rounds } => style(format!(
                "reviewed by {} (max {} rounds)",
                critic, max_rounds
            ))
            .dim()
            .to_string(),
            PhaseRole::Critic => style("critic").dim().to_string(),
        };
        println!(
            "{:<3} {:<22} {:<20} {:<22} {:<22} {}",
            phase.ordinal,
            phase.title,
            phase.agent,
            phase.model,
            phase.artifact_file_name(),
            role
        );
    }
    println!();
    Ok(())
}
