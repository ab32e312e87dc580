//! Run history and run detail: `pipewright history`, `pipewright show`.
//!
//! Both read straight from the output directory; no server needed.

use anyhow::{Context, Result, bail};
use console::style;
use std::sync::Arc;

use pipewright::config::PipewrightConfig;
use pipewright::run::{PhaseStatus, RunId, RunOutcome};
use pipewright::service::PipelineService;

fn outcome_label(outcome: Option<RunOutcome>, state: &str) -> String {
    match outcome {
        Some(RunOutcome::Succeeded) => style("succeeded").green().to_string(),
        Some(RunOutcome::Failed) => style("failed").red().to_string(),
        Some(RunOutcome::Cancelled) => style("cancelled").yellow().to_string(),
        None => style(state).cyan().to_string(),
    }
}

fn status_label(status: PhaseStatus) -> String {
    match status {
        PhaseStatus::Completed | PhaseStatus::Approved => style(status).green().to_string(),
        PhaseStatus::ApprovedWithReservations | PhaseStatus::Interrupted => {
            style(status).yellow().to_string()
        }
        PhaseStatus::Failed => style(status).red().to_string(),
        PhaseStatus::NotRun => style(status).dim().to_string(),
    }
}

pub async fn cmd_history(config: &PipewrightConfig, limit: usize) -> Result<()> {
    let service = Arc::new(PipelineService::from_config(config)?);
    let runs = service.history().await?;

    if runs.is_empty() {
        println!();
        println!("No runs found in {}", config.output_dir().display());
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<36}  {:<19}  {:<10}  {:>6}  Requirement",
        "Run", "Created", "Outcome", "Phases"
    );
    println!(
        "{:<36}  {:<19}  {:<10}  {:>6}  -----------",
        "-".repeat(36),
        "-".repeat(19),
        "-".repeat(10),
        "------"
    );
    for run in runs.iter().take(limit) {
        let label = outcome_label(run.outcome, &run.state);
        // Pad on the plain text; ANSI codes would throw the width off.
        let padding = 10usize.saturating_sub(console::measure_text_width(&label));
        println!(
            "{:<36}  {:<19}  {}{}  {:>6}  {}",
            run.run_id,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            label,
            " ".repeat(padding),
            run.phase_count,
            run.requirement
        );
    }
    if runs.len() > limit {
        println!();
        println!("{} more, use --limit to see them", runs.len() - limit);
    }
    println!();
    Ok(())
}

pub async fn cmd_show(config: &PipewrightConfig, run_id: &str, artifact: Option<&str>) -> Result<()> {
    let run_id: RunId = run_id
        .parse()
        .with_context(|| format!("Invalid run id: {}", run_id))?;
    let service = Arc::new(PipelineService::from_config(config)?);

    if let Some(file) = artifact {
        match service.artifact(run_id, file).await? {
            Some(content) => {
                println!("{}", content);
                return Ok(());
            }
            None => bail!("Artifact {} not found for run {}", file, run_id),
        }
    }

    let detail = service.detail(run_id).await?;
    let Some(manifest) = detail.manifest else {
        println!();
        println!("Run {} is {} and has no manifest yet.", run_id, detail.state);
        println!();
        return Ok(());
    };

    println!();
    println!("{} {}", style("Run").bold().cyan(), style(run_id).bold());
    println!("  Outcome:     {}", outcome_label(Some(manifest.outcome), &detail.state));
    println!("  Created:     {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Elapsed:     {:.1}s", manifest.elapsed_seconds);
    println!("  Directory:   {}", service.store().run_dir(run_id).display());
    if let Some(failure) = &manifest.failure {
        println!(
            "  {} {} round {} ({}): {}",
            style("Failure:").red().bold(),
            failure.phase,
            failure.round,
            failure.kind,
            failure.message
        );
    }
    println!();
    println!("  Requirement:");
    for line in manifest.requirement.lines() {
        println!("    {}", line);
    }
    println!();

    println!(
        "  {:<3} {:<22} {:<7} {:<28} Artifact",
        "#", "Phase", "Rounds", "Status"
    );
    for phase in &manifest.phases {
        let label = status_label(phase.status);
        let padding = 28usize.saturating_sub(console::measure_text_width(&label));
        println!(
            "  {:<3} {:<22} {:<7} {}{} {}",
            phase.ordinal,
            phase.title,
            phase.rounds,
            label,
            " ".repeat(padding),
            phase.artifact_file
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_label_falls_back_to_state() {
        let label = outcome_label(None, "running");
        assert_eq!(console::strip_ansi_codes(&label), "running");
    }

    #[test]
    fn test_status_label_text() {
        let label = status_label(PhaseStatus::ApprovedWithReservations);
        assert_eq!(
            console::strip_ansi_codes(&label),
            "approved_with_reservations"
        );
    }
}
