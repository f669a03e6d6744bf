//! Test runner: drives one backend across a job's test specs.
//!
//! Tests run sequentially and in spec order - sandbox spawn is the expensive
//! operation, and stopping after the first resource violation bounds
//! worst-case usage per job to one process at a time.

use anyhow::Result;
use rocode_common::types::{
    truncate_chars, TestResult, TestSpec, MAX_ERROR_MESSAGE_CHARS, MAX_STORED_OUTPUT_CHARS,
};
use tracing::debug;

use crate::backend::ExecutionBackend;
use crate::prelude;

/// Execute every test spec for one submission, short-circuiting on the
/// first timeout or memory violation. Unrun tests are absent from the
/// returned list, not represented as failures.
///
/// User-code faults come back inside the results; `Err` means the platform
/// itself failed and the job should hit the failure channel.
pub async fn run_tests(
    backend: &ExecutionBackend,
    code: &str,
    tests: &[TestSpec],
) -> Result<Vec<TestResult>> {
    let program = prelude::compose_program(code);
    let mut results = Vec::with_capacity(tests.len());

    for test in tests {
        let outcome = backend
            .execute(
                &program,
                &test.input,
                test.time_limit_ms,
                test.memory_limit_mb,
            )
            .await?;

        let actual = outcome.output.trim();
        let expected = test.expected_output.trim();
        // Exact trimmed match; no numeric tolerance, no per-line rewriting.
        let passed = outcome.error.is_none()
            && !outcome.timed_out
            && !outcome.memory_exceeded
            && actual == expected;

        debug!(
            test_id = %test.id,
            passed,
            runtime_ms = outcome.runtime_ms,
            timed_out = outcome.timed_out,
            memory_exceeded = outcome.memory_exceeded,
            simulated = outcome.simulated,
            "Test executed"
        );

        let stop = outcome.timed_out || outcome.memory_exceeded;

        results.push(TestResult {
            test_id: test.id,
            passed,
            actual_output: truncate_chars(actual, MAX_STORED_OUTPUT_CHARS),
            runtime_ms: outcome.runtime_ms,
            memory_kb: outcome.memory_kb,
            error: outcome
                .error
                .map(|e| truncate_chars(&e, MAX_ERROR_MESSAGE_CHARS)),
            timed_out: outcome.timed_out,
            memory_exceeded: outcome.memory_exceeded,
            simulated: outcome.simulated,
        });

        if stop {
            break;
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionOutcome, FixedBackend};
    use rocode_common::types::{
        SubmissionStatus, Visibility, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIME_LIMIT_MS,
    };
    use uuid::Uuid;

    fn spec(input: &str, expected: &str) -> TestSpec {
        TestSpec {
            id: Uuid::new_v4(),
            input: input.to_string(),
            expected_output: expected.to_string(),
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            visibility: Visibility::Public,
        }
    }

    fn ok_output(output: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            output: output.to_string(),
            runtime_ms: 12,
            ..Default::default()
        }
    }

    fn timeout_outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            timed_out: true,
            error: Some("Time limit exceeded".to_string()),
            runtime_ms: 1000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn matching_output_passes() {
        // a+b over two space-separated numbers: "2 3" -> "5"
        let backend = FixedBackend::new(vec![ok_output("5\n")]);
        let tests = vec![spec("2 3", "5")];

        let results = run_tests(&backend, "print(readnumbers()[1])", &tests)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert!(results[0].error.is_none());
    }

    #[tokio::test]
    async fn comparison_is_trimmed_exact_match() {
        let backend = FixedBackend::new(vec![ok_output("  42  \n"), ok_output("4 2")]);
        let tests = vec![spec("", "42"), spec("", "42")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert!(results[0].passed);
        assert!(!results[1].passed);
    }

    #[tokio::test]
    async fn timeout_short_circuits_remaining_tests() {
        // Three specs, but the second times out: the third must not run and
        // must be absent from the results, not failed.
        let backend = FixedBackend::new(vec![ok_output("1"), timeout_outcome()]);
        let tests = vec![spec("", "1"), spec("", "2"), spec("", "3")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(results[1].timed_out);
        assert!(!results[1].passed);
        assert_eq!(results[1].error.as_deref(), Some("Time limit exceeded"));
    }

    #[tokio::test]
    async fn memory_violation_short_circuits() {
        let oom = ExecutionOutcome {
            memory_exceeded: true,
            error: Some("Memory limit exceeded".to_string()),
            ..Default::default()
        };
        let backend = FixedBackend::new(vec![oom]);
        let tests = vec![spec("", "1"), spec("", "2")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].memory_exceeded);
    }

    #[tokio::test]
    async fn runtime_error_fails_but_does_not_short_circuit() {
        let crash = ExecutionOutcome {
            error: Some("attempt to call a nil value".to_string()),
            ..Default::default()
        };
        let backend = FixedBackend::new(vec![crash, ok_output("2")]);
        let tests = vec![spec("", "1"), spec("", "2")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(!results[0].passed);
        assert_eq!(
            results[0].error.as_deref(),
            Some("attempt to call a nil value")
        );
        assert!(results[1].passed);
    }

    #[tokio::test]
    async fn error_never_passes_even_with_matching_output() {
        let lying = ExecutionOutcome {
            output: "5".to_string(),
            error: Some("Runtime error".to_string()),
            ..Default::default()
        };
        let backend = FixedBackend::new(vec![lying]);
        let tests = vec![spec("2 3", "5")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert!(!results[0].passed);
    }

    #[tokio::test]
    async fn stored_output_is_capped() {
        let huge = "y".repeat(MAX_STORED_OUTPUT_CHARS + 500);
        let backend = FixedBackend::new(vec![ok_output(&huge)]);
        let tests = vec![spec("", "something else")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert_eq!(results[0].actual_output.chars().count(), MAX_STORED_OUTPUT_CHARS);
    }

    #[tokio::test]
    async fn simulated_execution_marks_every_stored_result() {
        // A host degraded to the simulation fallback must not hand out
        // authoritative-looking results: the mark has to reach the wire.
        use crate::backend::SimulateBackend;

        let backend = ExecutionBackend::Simulate(SimulateBackend);
        let tests = vec![spec("", "5")];

        let results = run_tests(&backend, "print(\"5\")", &tests).await.unwrap();

        assert!(results[0].simulated);
        let wire = serde_json::to_string(&results[0]).unwrap();
        assert!(wire.contains("\"simulated\":true"));
    }

    #[tokio::test]
    async fn wrong_answer_on_third_test_classifies_after_full_run() {
        let backend = FixedBackend::new(vec![
            ok_output("1"),
            ok_output("2"),
            ok_output("unexpected"),
        ]);
        let tests = vec![spec("", "1"), spec("", "2"), spec("", "3")];

        let results = run_tests(&backend, "", &tests).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(
            SubmissionStatus::classify(&results),
            SubmissionStatus::WrongAnswer
        );
    }
}
