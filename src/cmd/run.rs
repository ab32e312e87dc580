//! `pipewright run`: execute one run in-process and print its events.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use pipewright::config::PipewrightConfig;
use pipewright::events::{Event, EventKind};
use pipewright::run::RunOutcome;
use pipewright::service::PipelineService;

/// The requirement from the argument or from `--file`.
pub fn read_requirement(arg: Option<&str>, file: Option<&Path>) -> Result<String> {
    match (arg, file) {
        (Some(text), _) => Ok(text.to_string()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read requirement file: {}", path.display())),
        (None, None) => bail!("Give a requirement or --file <path>"),
    }
}

fn field<'a>(event: &'a Event, key: &str) -> Option<&'a serde_json::Value> {
    event.payload.get(key)
}

fn text<'a>(event: &'a Event, key: &str) -> &'a str {
    field(event, key).and_then(|v| v.as_str()).unwrap_or("")
}

fn number(event: &Event, key: &str) -> u64 {
    field(event, key).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn print_event(event: &Event, stream: bool) {
    let phase = event.phase.as_deref().unwrap_or("");
    match event.kind {
        EventKind::RunStarted => {
            let phases = field(event, "phases")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            println!(
                "{} {} ({} phases)",
                style("Run").bold().cyan(),
                style(event.run_id).bold(),
                phases
            );
        }
        EventKind::PhaseStarted => {
            println!();
            println!(
                "{} {} {}",
                style(format!("[{}]", number(event, "ordinal"))).dim(),
                style(text(event, "title")).bold(),
                style(format!("({}, {})", text(event, "agent"), text(event, "model"))).dim()
            );
        }
        EventKind::PhaseChunk => {
            if stream {
                print!("{}", text(event, "text"));
                if number(event, "index") + 1 == number(event, "total") {
                    println!();
                }
            }
        }
        EventKind::RevisionRound => {
            let round = number(event, "round");
            let max = number(event, "max_rounds");
            let verdict = text(event, "verdict");
            let verdict = match verdict {
                "approved" => style(verdict).green().to_string(),
                "" => String::new(),
                other => style(other).yellow().to_string(),
            };
            println!(
                "  {} round {}/{} {} {}",
                style("↻").cyan(),
                round,
                max,
                text(event, "role"),
                verdict
            );
        }
        EventKind::PhaseCompleted => {
            let status = text(event, "status");
            let marker = match status {
                "approved_with_reservations" => style("⚠").yellow(),
                _ => style("✓").green(),
            };
            println!(
                "  {} {} {} → {}",
                marker,
                phase,
                style(status).dim(),
                text(event, "artifact_file")
            );
        }
        EventKind::RunCompleted => {
            println!();
            println!("{}", style("Run completed").bold().green());
        }
        EventKind::RunFailed => {
            println!();
            println!(
                "{} {} (round {}): {}",
                style("Run failed in").red().bold(),
                text(event, "phase"),
                number(event, "round"),
                text(event, "message")
            );
        }
        EventKind::RunCancelled => {
            println!();
            println!("{}", style("Run cancelled").yellow().bold());
        }
    }
}

pub async fn cmd_run(config: &PipewrightConfig, requirement: &str, stream: bool) -> Result<()> {
    let service = Arc::new(PipelineService::from_config(config)?);

    let run_id = service.register(requirement)?;
    let mut subscription = service.subscribe(run_id).await?;
    service.start(run_id)?;

    let ctrl_c = {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n{}", style("Cancelling...").yellow());
                if let Err(e) = service.cancel(run_id).await {
                    tracing::warn!(error = %e, "Failed to cancel run");
                }
            }
        })
    };

    while let Some(event) = subscription.next().await {
        print_event(&event, stream);
    }
    ctrl_c.abort();

    let run = service.wait(run_id).await?;
    let run_dir = service.store().run_dir(run_id);
    println!("{} {}", style("Artifacts:").dim(), run_dir.display());
    if let Some(elapsed) = run.elapsed_seconds() {
        println!("{} {:.1}s", style("Elapsed:").dim(), elapsed);
    }

    match run.outcome() {
        Some(RunOutcome::Succeeded) | Some(RunOutcome::Cancelled) => Ok(()),
        _ => match run.failure {
            Some(failure) => bail!(
                "Run {} failed in phase {} ({}): {}",
                run_id,
                failure.phase,
                failure.kind,
                failure.message
            ),
            None => bail!("Run {} did not finish", run_id),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_requirement_prefers_argument() {
        assert_eq!(read_requirement(Some("build x"), None).unwrap(), "build x");
    }

    #[test]
    fn test_read_requirement_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.txt");
        std::fs::write(&path, "a todo app").unwrap();
        assert_eq!(read_requirement(None, Some(&path)).unwrap(), "a todo app");
    }

    #[test]
    fn test_read_requirement_needs_something() {
        assert!(read_requirement(None, None).is_err());
    }
}
