use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conservative fallbacks applied when a test spec omits its limits.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 5_000;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 128;

/// Per-test output stored in results is capped so a flood of correct-looking
/// output cannot blow up the persisted row.
pub const MAX_STORED_OUTPUT_CHARS: usize = 10_000;
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1_000;

/// A unit of judge work pulled off the shared queue.
///
/// The three job shapes share one queue and are distinguished by the `kind`
/// tag on the wire. Keeping this a sum type means the single dispatch point
/// in the worker matches exhaustively, so adding a fourth kind is a
/// compile-time-checked change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Ad hoc, ungraded run against a problem's tests. Result is cached
    /// under a short TTL for client polling.
    Run {
        job_id: Uuid,
        code: String,
        tests: Vec<TestSpec>,
    },
    /// Graded submission. Persisted, and triggers solve recording plus a
    /// similarity scan when accepted.
    Submit {
        submission_id: Uuid,
        problem_id: Uuid,
        user_id: Uuid,
        code: String,
        tests: Vec<TestSpec>,
    },
    /// Anonymous playground execution with no problem association.
    Playground { job_id: Uuid, code: String },
}

impl Job {
    /// The identifier results are keyed by.
    pub fn id(&self) -> Uuid {
        match self {
            Job::Run { job_id, .. } => *job_id,
            Job::Submit { submission_id, .. } => *submission_id,
            Job::Playground { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Run { .. } => "run",
            Job::Submit { .. } => "submit",
            Job::Playground { .. } => "playground",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    /// Hidden test internals are never persisted to user-visible storage.
    #[default]
    Hidden,
}

/// One test case: input, expected output, and the resource limits the
/// executor must honor for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: Uuid,
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub visibility: Visibility,
}

fn default_time_limit_ms() -> u64 {
    DEFAULT_TIME_LIMIT_MS
}

fn default_memory_limit_mb() -> u64 {
    DEFAULT_MEMORY_LIMIT_MB
}

/// Outcome of running one test spec. Created once per execution, never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: Uuid,
    pub passed: bool,
    pub actual_output: String,
    pub runtime_ms: u64,
    /// Best effort. Zero when the backend cannot measure memory.
    pub memory_kb: u64,
    pub error: Option<String>,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// True when produced by the simulation fallback. Simulated results
    /// are non-authoritative and carry this mark all the way to storage.
    #[serde(default)]
    pub simulated: bool,
}

/// Terminal status of a graded submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Accepted,
    TimeLimit,
    MemoryLimit,
    RuntimeError,
    WrongAnswer,
    /// Queue-level fault (worker exception). Never produced by `classify`;
    /// written directly when a submission job dies in the worker.
    Failed,
}

impl SubmissionStatus {
    /// Map aggregated test results to one terminal status.
    ///
    /// Precedence, highest first: accepted, time limit, memory limit,
    /// runtime error, wrong answer. A resource violation outranks a wrong
    /// answer on an earlier test because it means the code is unsafe to
    /// keep testing at all.
    pub fn classify(results: &[TestResult]) -> Self {
        if results.iter().all(|r| r.passed) {
            SubmissionStatus::Accepted
        } else if results.iter().any(|r| r.timed_out) {
            SubmissionStatus::TimeLimit
        } else if results.iter().any(|r| r.memory_exceeded) {
            SubmissionStatus::MemoryLimit
        } else if results.iter().any(|r| r.error.is_some()) {
            SubmissionStatus::RuntimeError
        } else {
            SubmissionStatus::WrongAnswer
        }
    }
}

/// The persisted per-submission outcome handed to the storage layer.
///
/// Only public-visibility test results are carried; hidden-test detail never
/// leaves the judge beyond the coarse status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub status: SubmissionStatus,
    /// Sum of runtimes across all executed tests.
    pub runtime_ms: u64,
    /// Peak memory across all executed tests.
    pub memory_kb: u64,
    pub test_results: Vec<TestResult>,
    pub error_message: Option<String>,
}

impl SubmissionRow {
    /// Row written when execution begins. Replaced by the final row, or by
    /// a `failed` row if the worker faults; the key always holds this shape.
    pub fn running() -> Self {
        SubmissionRow {
            status: SubmissionStatus::Running,
            runtime_ms: 0,
            memory_kb: 0,
            test_results: Vec::new(),
            error_message: None,
        }
    }

    /// Terminal row for a worker fault. No results were produced; the
    /// fault text doubles as the dead-letter record's error.
    pub fn failed(error: &str) -> Self {
        SubmissionRow {
            status: SubmissionStatus::Failed,
            runtime_ms: 0,
            memory_kb: 0,
            test_results: Vec::new(),
            error_message: Some(truncate_chars(error, MAX_ERROR_MESSAGE_CHARS)),
        }
    }

    /// Aggregate executed test results into the row persisted for a
    /// submission. Pure; the multiset of result flags fully determines the
    /// status.
    pub fn from_results(results: &[TestResult], tests: &[TestSpec]) -> Self {
        let status = SubmissionStatus::classify(results);
        let runtime_ms = results.iter().map(|r| r.runtime_ms).sum();
        let memory_kb = results.iter().map(|r| r.memory_kb).max().unwrap_or(0);

        let public_results = results
            .iter()
            .filter(|r| {
                tests
                    .iter()
                    .any(|t| t.id == r.test_id && t.visibility == Visibility::Public)
            })
            .cloned()
            .collect();

        let error_message = results
            .iter()
            .find_map(|r| r.error.as_deref())
            .map(|e| truncate_chars(e, MAX_ERROR_MESSAGE_CHARS));

        SubmissionRow {
            status,
            runtime_ms,
            memory_kb,
            test_results: public_results,
            error_message,
        }
    }
}

/// Cached payload for `run` jobs, polled by the client through the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: String,
    pub results: Vec<TestResult>,
}

impl RunOutcome {
    pub fn completed(results: Vec<TestResult>) -> Self {
        RunOutcome {
            status: "completed".to_string(),
            results,
        }
    }
}

/// Cached payload for `playground` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaygroundOutcome {
    pub status: String,
    pub output: String,
    pub error: Option<String>,
    pub runtime_ms: u64,
    /// True when the host degraded to simulated execution.
    #[serde(default)]
    pub simulated: bool,
}

/// Directional record linking a submission to a previously accepted
/// submission it closely resembles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityFlag {
    pub submission_id: Uuid,
    pub matched_submission_id: Uuid,
    /// Combined lexical similarity in [0, 1], fixed to four decimals.
    pub score: String,
    pub flagged_at: DateTime<Utc>,
}

/// Accepted source retained for similarity comparison against later
/// submissions to the same problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedCode {
    pub submission_id: Uuid,
    pub user_id: Uuid,
    pub code: String,
}

/// Truncate on a char boundary. Byte-slicing user output can split a
/// multi-byte character and panic downstream.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(id: Uuid) -> TestResult {
        TestResult {
            test_id: id,
            passed: true,
            actual_output: "ok".to_string(),
            runtime_ms: 10,
            memory_kb: 0,
            error: None,
            timed_out: false,
            memory_exceeded: false,
            simulated: false,
        }
    }

    fn wrong(id: Uuid) -> TestResult {
        TestResult {
            passed: false,
            ..passed(id)
        }
    }

    fn timed_out(id: Uuid) -> TestResult {
        TestResult {
            passed: false,
            timed_out: true,
            error: Some("Time limit exceeded".to_string()),
            ..passed(id)
        }
    }

    fn errored(id: Uuid, message: &str) -> TestResult {
        TestResult {
            passed: false,
            error: Some(message.to_string()),
            ..passed(id)
        }
    }

    #[test]
    fn classify_all_passed_is_accepted() {
        let results = vec![passed(Uuid::new_v4()), passed(Uuid::new_v4())];
        assert_eq!(
            SubmissionStatus::classify(&results),
            SubmissionStatus::Accepted
        );
    }

    #[test]
    fn classify_timeout_outranks_wrong_answer() {
        // First test merely mismatched; second timed out. The timeout wins.
        let results = vec![wrong(Uuid::new_v4()), timed_out(Uuid::new_v4())];
        assert_eq!(
            SubmissionStatus::classify(&results),
            SubmissionStatus::TimeLimit
        );
    }

    #[test]
    fn classify_memory_outranks_runtime_error() {
        let mut oom = wrong(Uuid::new_v4());
        oom.memory_exceeded = true;
        oom.error = Some("Memory limit exceeded".to_string());
        let results = vec![errored(Uuid::new_v4(), "boom"), oom];
        assert_eq!(
            SubmissionStatus::classify(&results),
            SubmissionStatus::MemoryLimit
        );
    }

    #[test]
    fn classify_runtime_error_outranks_wrong_answer() {
        let results = vec![wrong(Uuid::new_v4()), errored(Uuid::new_v4(), "nil value")];
        assert_eq!(
            SubmissionStatus::classify(&results),
            SubmissionStatus::RuntimeError
        );
    }

    #[test]
    fn classify_mismatch_only_is_wrong_answer() {
        let results = vec![passed(Uuid::new_v4()), wrong(Uuid::new_v4())];
        assert_eq!(
            SubmissionStatus::classify(&results),
            SubmissionStatus::WrongAnswer
        );
    }

    #[test]
    fn row_aggregates_totals_and_peak() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut first = passed(a);
        first.runtime_ms = 30;
        first.memory_kb = 2048;
        let mut second = passed(b);
        second.runtime_ms = 70;
        second.memory_kb = 1024;

        let tests = vec![spec(a, Visibility::Public), spec(b, Visibility::Hidden)];
        let row = SubmissionRow::from_results(&[first, second], &tests);

        assert_eq!(row.status, SubmissionStatus::Accepted);
        assert_eq!(row.runtime_ms, 100);
        assert_eq!(row.memory_kb, 2048);
    }

    #[test]
    fn row_carries_public_results_only() {
        let public_id = Uuid::new_v4();
        let hidden_id = Uuid::new_v4();
        let tests = vec![
            spec(public_id, Visibility::Public),
            spec(hidden_id, Visibility::Hidden),
        ];
        let results = vec![passed(public_id), wrong(hidden_id)];

        let row = SubmissionRow::from_results(&results, &tests);

        assert_eq!(row.test_results.len(), 1);
        assert_eq!(row.test_results[0].test_id, public_id);
    }

    #[test]
    fn row_surfaces_first_error_truncated() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let long_message = "x".repeat(MAX_ERROR_MESSAGE_CHARS + 50);
        let results = vec![errored(a, &long_message), errored(b, "second")];
        let tests = vec![spec(a, Visibility::Public), spec(b, Visibility::Public)];

        let row = SubmissionRow::from_results(&results, &tests);

        let message = row.error_message.expect("first error expected");
        assert_eq!(message.len(), MAX_ERROR_MESSAGE_CHARS);
        assert!(message.chars().all(|c| c == 'x'));
    }

    #[test]
    fn running_row_shares_the_final_row_shape() {
        // One key, one payload shape across the whole lifecycle: a
        // consumer parsing SubmissionRow must read the running marker too.
        let wire = serde_json::to_string(&SubmissionRow::running()).unwrap();
        let parsed: SubmissionRow = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.status, SubmissionStatus::Running);
        assert!(parsed.test_results.is_empty());
        assert!(parsed.error_message.is_none());
    }

    #[test]
    fn failed_row_is_terminal_and_carries_the_fault() {
        let long_fault = "f".repeat(MAX_ERROR_MESSAGE_CHARS + 10);
        let row = SubmissionRow::failed(&long_fault);
        assert_eq!(row.status, SubmissionStatus::Failed);
        assert!(row.test_results.is_empty());
        assert_eq!(
            row.error_message.as_deref().map(str::len),
            Some(MAX_ERROR_MESSAGE_CHARS)
        );
    }

    #[test]
    fn simulated_flag_survives_the_wire_and_defaults_false() {
        let mut result = passed(Uuid::new_v4());
        result.simulated = true;
        let wire = serde_json::to_string(&result).unwrap();
        assert!(wire.contains("\"simulated\":true"));

        // Payloads written before the flag existed still parse.
        let legacy = wire.replace("\"simulated\":true,", "").replace(",\"simulated\":true", "");
        let parsed: TestResult = serde_json::from_str(&legacy).unwrap();
        assert!(!parsed.simulated);
    }

    #[test]
    fn job_tag_round_trips_by_kind() {
        let job = Job::Playground {
            job_id: Uuid::new_v4(),
            code: "print(1)".to_string(),
        };
        let wire = serde_json::to_string(&job).unwrap();
        assert!(wire.contains("\"kind\":\"playground\""));

        let parsed: Job = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.kind(), "playground");
        assert_eq!(parsed.id(), job.id());
    }

    #[test]
    fn test_spec_limits_default_when_omitted() {
        let wire = format!(
            r#"{{"id":"{}","input":"1 2","expected_output":"3"}}"#,
            Uuid::new_v4()
        );
        let spec: TestSpec = serde_json::from_str(&wire).unwrap();
        assert_eq!(spec.time_limit_ms, DEFAULT_TIME_LIMIT_MS);
        assert_eq!(spec.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);
        assert_eq!(spec.visibility, Visibility::Hidden);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("", 5), "");
    }

    fn spec(id: Uuid, visibility: Visibility) -> TestSpec {
        TestSpec {
            id,
            input: String::new(),
            expected_output: "ok".to_string(),
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            visibility,
        }
    }
}
