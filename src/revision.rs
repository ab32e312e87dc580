//! Bounded producer/critic revision loop.
//!
//! Each round runs the producer, then the critic on the fresh draft. The loop
//! stops on the first approval or after `max_rounds` rounds. Running out of
//! rounds is not a failure: the last draft stands, marked
//! `approved_with_reservations`.

use crate::errors::PipelineError;
use crate::executor::PhaseExecutor;
use crate::prompt::PriorArtifact;
use crate::run::{PhaseResult, PhaseStatus};
use crate::sequencer::RunContext;
use crate::verdict::Verdict;

/// Result of a finished revision loop.
#[derive(Debug, Clone)]
pub struct RevisionOutcome {
    pub status: PhaseStatus,
    pub rounds: u32,
    /// Last producer result; its artifact is canonical.
    pub producer: PhaseResult,
    /// Last critic result; its text is the review of record.
    pub critic: PhaseResult,
}

pub(crate) async fn run_revision(
    ctx: &mut RunContext<'_>,
    executor: &PhaseExecutor,
    producer: usize,
    critic: usize,
    max_rounds: u32,
) -> Result<RevisionOutcome, PipelineError> {
    let topology = ctx.topology();
    let producer_def = topology.phase(producer);
    let critic_def = topology.phase(critic);
    let run_id = ctx.run_id();
    let cancel = ctx.cancel_token();

    ctx.phase_started(producer);

    let mut feedback: Option<(String, String)> = None;
    let mut round = 1;
    loop {
        if round > 1 {
            ctx.set_current(producer, round);
        }
        let mut input = ctx.input();
        if let Some((draft, review)) = feedback.take() {
            input = input.with_revision(&draft, &review);
        }
        let draft = executor
            .execute(run_id, producer_def, input, round, cancel)
            .await?;
        ctx.record(&draft);
        ctx.revision_round(&draft, "producer", max_rounds);
        ctx.ensure_not_cancelled()?;

        if round == 1 {
            ctx.phase_started(critic);
        } else {
            ctx.set_current(critic, round);
        }
        let mut input = ctx.input();
        input.prior.push(PriorArtifact {
            phase: producer_def.name.clone(),
            title: producer_def.title.clone(),
            content: draft.artifact.clone(),
        });
        let review = executor
            .execute(run_id, critic_def, input, round, cancel)
            .await?;
        ctx.record(&review);
        ctx.revision_round(&review, "critic", max_rounds);
        ctx.ensure_not_cancelled()?;

        let verdict = review.verdict.unwrap_or(Verdict::Unparseable);
        tracing::info!(
            producer = %producer_def.name,
            round,
            max_rounds,
            verdict = %verdict,
            "Revision round finished"
        );

        if verdict.is_approved() {
            return Ok(RevisionOutcome {
                status: PhaseStatus::Approved,
                rounds: round,
                producer: draft,
                critic: review,
            });
        }
        if verdict == Verdict::Unparseable {
            tracing::warn!(
                critic = %critic_def.name,
                round,
                "Review has no clear verdict, treating it as a rejection"
            );
        }
        if round >= max_rounds {
            tracing::warn!(
                producer = %producer_def.name,
                rounds = round,
                "Round budget exhausted without approval"
            );
            return Ok(RevisionOutcome {
                status: PhaseStatus::ApprovedWithReservations,
                rounds: round,
                producer: draft,
                critic: review,
            });
        }

        feedback = Some((draft.artifact, review.artifact));
        round += 1;
    }
}
