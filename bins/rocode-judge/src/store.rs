//! Persistence hand-off for graded submissions.
//!
//! The judge does not own the relational schema - the API layer does. What
//! the judge owns is the Redis surface the API layer consumes: the
//! submission row written through its status transitions, the idempotent
//! solve set, problem aggregate counters, the capped window of recent
//! accepted sources feeding the similarity scanner, and emitted flags.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use rocode_common::types::{AcceptedCode, SimilarityFlag, SubmissionRow};
use tracing::warn;
use uuid::Uuid;

/// Most recent accepted sources retained per problem for similarity scans.
pub const ACCEPTED_WINDOW: usize = 100;

pub fn submission_key(submission_id: &Uuid) -> String {
    format!("rocode:submission:{}", submission_id)
}

pub fn solves_key(problem_id: &Uuid) -> String {
    format!("rocode:solves:{}", problem_id)
}

pub fn problem_stats_key(problem_id: &Uuid) -> String {
    format!("rocode:problem:{}:stats", problem_id)
}

pub fn accepted_key(problem_id: &Uuid) -> String {
    format!("rocode:accepted:{}", problem_id)
}

pub fn flags_key(submission_id: &Uuid) -> String {
    format!("rocode:flags:{}", submission_id)
}

#[derive(Clone)]
pub struct SubmissionStore {
    conn: redis::aio::ConnectionManager,
}

impl SubmissionStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        SubmissionStore { conn }
    }

    /// Transition the submission to `running` before execution starts. A
    /// worker crash mid-run then leaves a visible stuck-running row - an
    /// operational signal, deliberately distinguishable from `pending`.
    /// The payload is a full row so the key holds one shape for its whole
    /// lifecycle.
    pub async fn mark_running(&mut self, submission_id: Uuid) -> Result<()> {
        let payload = serde_json::to_string(&SubmissionRow::running())
            .context("Failed to serialize running row")?;
        let _: () = self
            .conn
            .set(submission_key(&submission_id), payload)
            .await
            .context("Failed to mark submission running")?;
        Ok(())
    }

    /// Terminalize a submission whose job faulted in the worker. Without
    /// this the row would read `running` forever while only the
    /// dead-letter list knew the truth.
    pub async fn mark_failed(&mut self, submission_id: Uuid, error: &str) -> Result<()> {
        let payload = serde_json::to_string(&SubmissionRow::failed(error))
            .context("Failed to serialize failed row")?;
        let _: () = self
            .conn
            .set(submission_key(&submission_id), payload)
            .await
            .context("Failed to mark submission failed")?;
        Ok(())
    }

    /// Write the final submission row. Immutable once written.
    pub async fn finish(&mut self, submission_id: Uuid, row: &SubmissionRow) -> Result<()> {
        let payload = serde_json::to_string(row).context("Failed to serialize submission row")?;
        let _: () = self
            .conn
            .set(submission_key(&submission_id), payload)
            .await
            .context("Failed to persist submission row")?;
        Ok(())
    }

    /// Record that the user solved the problem. SADD makes recording the
    /// same (user, problem) pair twice a no-op. Returns true if this call
    /// created the record.
    pub async fn record_solve(&mut self, user_id: Uuid, problem_id: Uuid) -> Result<bool> {
        let added: i64 = self
            .conn
            .sadd(solves_key(&problem_id), user_id.to_string())
            .await
            .context("Failed to record solve")?;
        Ok(solve_created(added))
    }

    /// Bump the problem's aggregate counters for an accepted submission.
    pub async fn bump_problem_counters(&mut self, problem_id: Uuid) -> Result<()> {
        let key = problem_stats_key(&problem_id);
        let _: () = self
            .conn
            .hincr(&key, "submission_count", 1)
            .await
            .context("Failed to bump submission count")?;
        let _: () = self
            .conn
            .hincr(&key, "accepted_count", 1)
            .await
            .context("Failed to bump accepted count")?;
        Ok(())
    }

    /// Retain this accepted source in the problem's comparison window,
    /// newest first, capped.
    pub async fn push_accepted_code(
        &mut self,
        problem_id: Uuid,
        accepted: &AcceptedCode,
    ) -> Result<()> {
        let key = accepted_key(&problem_id);
        let payload = serde_json::to_string(accepted).context("Failed to serialize accepted code")?;
        let _: () = self
            .conn
            .lpush(&key, payload)
            .await
            .context("Failed to push accepted code")?;
        let _: () = self
            .conn
            .ltrim(&key, 0, (ACCEPTED_WINDOW as isize) - 1)
            .await
            .context("Failed to trim accepted window")?;
        Ok(())
    }

    /// The most recent accepted sources for a problem, newest first.
    /// Malformed entries are skipped with a warning rather than failing the
    /// whole scan.
    pub async fn recent_accepted(&mut self, problem_id: Uuid) -> Result<Vec<AcceptedCode>> {
        let payloads: Vec<String> = self
            .conn
            .lrange(accepted_key(&problem_id), 0, (ACCEPTED_WINDOW as isize) - 1)
            .await
            .context("Failed to read accepted window")?;

        let mut accepted = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str(&payload) {
                Ok(entry) => accepted.push(entry),
                Err(e) => {
                    warn!(problem_id = %problem_id, error = %e, "Skipping malformed accepted entry");
                }
            }
        }
        Ok(accepted)
    }

    /// Append a similarity flag to the submission's audit trail. Flags are
    /// never deleted by the judge.
    pub async fn push_flag(&mut self, flag: &SimilarityFlag) -> Result<()> {
        let payload = serde_json::to_string(flag).context("Failed to serialize similarity flag")?;
        let _: () = self
            .conn
            .rpush(flags_key(&flag.submission_id), payload)
            .await
            .context("Failed to push similarity flag")?;
        Ok(())
    }
}

/// SADD returns the number of members the call added to the set: 1 the
/// first time a (user, problem) pair lands, 0 on every repeat.
fn solve_created(added: i64) -> bool {
    added > 0
}
