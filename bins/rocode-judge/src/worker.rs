//! Worker loop and the single job dispatch point.
//!
//! Each worker owns its job exclusively from pop to completion and writes
//! results keyed by that job's identifier, so no locking is needed across
//! the pool. A worker fault marks the job failed on the dead-letter channel
//! and the pool keeps running.

use anyhow::{Context, Result};
use rocode_common::queue;
use rocode_common::types::{
    AcceptedCode, Job, PlaygroundOutcome, RunOutcome, SubmissionRow, SubmissionStatus,
    DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIME_LIMIT_MS,
};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::context::JudgeContext;
use crate::prelude;
use crate::runner;
use crate::similarity;

/// BLPOP timeout; bounds how long a drained worker takes to notice
/// shutdown.
const POP_TIMEOUT_SECS: f64 = 5.0;

#[instrument(skip(ctx, shutdown), fields(worker = worker_id))]
pub async fn worker_loop(
    worker_id: usize,
    mut ctx: JudgeContext,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Worker started");

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        match queue::pop_job(&mut ctx.redis, POP_TIMEOUT_SECS).await {
            Ok(Some(job)) => {
                let job_id = job.id();
                let kind = job.kind();
                let graded = matches!(job, Job::Submit { .. });
                info!(job_id = %job_id, kind, "Received job");

                let started = std::time::Instant::now();
                match process_job(&mut ctx, job).await {
                    Ok(()) => {
                        info!(
                            job_id = %job_id,
                            kind,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Job completed"
                        );
                    }
                    Err(e) => {
                        let fault = format!("{e:#}");
                        error!(job_id = %job_id, kind, error = %fault, "Job failed");

                        // A faulted submission must not sit in `running`
                        // forever; terminalize the row before dead-lettering.
                        if graded {
                            if let Err(mark_err) =
                                ctx.store.mark_failed(job_id, &fault).await
                            {
                                error!(job_id = %job_id, error = %mark_err, "Failed to mark submission failed");
                            }
                        }

                        if let Err(report_err) =
                            queue::report_failure(&mut ctx.redis, job_id, kind, &fault).await
                        {
                            error!(job_id = %job_id, error = %report_err, "Failed to dead-letter job");
                        }
                    }
                }
            }
            Ok(None) => {
                // Pop timed out; loop to re-check shutdown.
            }
            Err(e) => {
                error!(error = %e, "Redis error while polling queue");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }

    info!("Worker drained");
}

/// The single dispatch point over the job sum type. Adding a job kind
/// fails to compile until it is handled here.
async fn process_job(ctx: &mut JudgeContext, job: Job) -> Result<()> {
    match job {
        Job::Run {
            job_id,
            code,
            tests,
        } => {
            let results = runner::run_tests(&ctx.backend, &code, &tests).await?;
            queue::store_run_result(&mut ctx.redis, &job_id, &RunOutcome::completed(results))
                .await
                .context("Failed to cache run result")?;
            Ok(())
        }

        Job::Playground { job_id, code } => {
            let program = prelude::compose_program(&code);
            let outcome = ctx
                .backend
                .execute(&program, "", DEFAULT_TIME_LIMIT_MS, DEFAULT_MEMORY_LIMIT_MB)
                .await?;

            let payload = PlaygroundOutcome {
                status: "completed".to_string(),
                output: outcome.output.trim().to_string(),
                error: outcome.error,
                runtime_ms: outcome.runtime_ms,
                simulated: outcome.simulated,
            };
            queue::store_playground_result(&mut ctx.redis, &job_id, &payload)
                .await
                .context("Failed to cache playground result")?;
            Ok(())
        }

        Job::Submit {
            submission_id,
            problem_id,
            user_id,
            code,
            tests,
        } => {
            // Visible `running` state first: a crash mid-run must look
            // stuck-running, not pending forever.
            ctx.store.mark_running(submission_id).await?;

            let results = runner::run_tests(&ctx.backend, &code, &tests).await?;
            let row = SubmissionRow::from_results(&results, &tests);
            let status = row.status;

            ctx.store.finish(submission_id, &row).await?;

            info!(
                submission_id = %submission_id,
                status = ?status,
                tests_run = results.len(),
                tests_total = tests.len(),
                "Submission judged"
            );

            if status == SubmissionStatus::Accepted {
                on_accepted(ctx, submission_id, problem_id, user_id, &code).await;
            }

            Ok(())
        }
    }
}

/// Side effects of acceptance. All idempotent or append-only, and none of
/// them may fail the already-judged submission - problems here are logged
/// and swallowed.
async fn on_accepted(
    ctx: &mut JudgeContext,
    submission_id: Uuid,
    problem_id: Uuid,
    user_id: Uuid,
    code: &str,
) {
    match ctx.store.record_solve(user_id, problem_id).await {
        Ok(true) => info!(user_id = %user_id, problem_id = %problem_id, "Solve recorded"),
        Ok(false) => {} // repeat solve, no-op
        Err(e) => warn!(error = %format!("{e:#}"), "Failed to record solve"),
    }

    if let Err(e) = ctx.store.bump_problem_counters(problem_id).await {
        warn!(error = %format!("{e:#}"), "Failed to bump problem counters");
    }

    if let Err(e) = ctx
        .store
        .push_accepted_code(
            problem_id,
            &AcceptedCode {
                submission_id,
                user_id,
                code: code.to_string(),
            },
        )
        .await
    {
        warn!(error = %format!("{e:#}"), "Failed to retain accepted code");
    }

    // Audit trail only; never blocks the submission result.
    match similarity::scan(&mut ctx.store, problem_id, submission_id, code).await {
        Ok(0) => {}
        Ok(flags) => info!(submission_id = %submission_id, flags, "Similarity flags emitted"),
        Err(e) => warn!(error = %format!("{e:#}"), "Similarity scan failed"),
    }
}
