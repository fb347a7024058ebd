/// Test Validator - Language-Agnostic Comparison
///
/// **Core Responsibility:**
/// Decide whether a program's raw output matches an expected output, and
/// turn raw sandbox outputs into per-case `ExecutionResult`s.
///
/// **Critical Properties:**
/// - Knows nothing about how the program was run
/// - Pure: (expected, actual) -> passed
/// - The same rule is used when producing expected outputs and when
///   judging submissions
///
/// **Normalization Rules:**
/// - Trailing whitespace on each line: ignored
/// - Trailing blank lines: ignored
/// - `\r\n` vs `\n`: ignored
/// - Leading whitespace, inner whitespace, case: significant

use crate::engine::{RunOutput, MAX_OUTPUT_BYTES};
use caseforge_common::types::{ExecutionResult, ExecutionStatus, Tally, TestCase};

/// Longest stderr excerpt kept on a result
const MAX_ERROR_CHARS: usize = 2000;

pub fn normalize(output: &str) -> String {
    let mut lines: Vec<&str> = output.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// `Validate(expected, actual)`
pub fn validate(expected: &str, actual: &str) -> bool {
    normalize(expected) == normalize(actual)
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.char_indices().nth(MAX_ERROR_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Why a run did not produce a usable output, if it did not
pub fn failure_reason(output: &RunOutput, timeout_ms: u64) -> Option<String> {
    match output.status() {
        ExecutionStatus::Success => None,
        ExecutionStatus::Timeout => Some(format!("time limit exceeded ({}ms)", timeout_ms)),
        _ if output.output_limit_exceeded => Some(format!(
            "output limit exceeded ({} bytes)",
            MAX_OUTPUT_BYTES
        )),
        _ => {
            let code = output
                .exit_code
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "killed by signal".to_string());
            if output.stderr.trim().is_empty() {
                Some(code)
            } else {
                Some(format!("{}: {}", code, excerpt(&output.stderr)))
            }
        }
    }
}

/// Judge one run against its test case.
///
/// A case without an expected output cannot be confirmed and counts as a
/// validation error.
pub fn judge(case: &TestCase, output: &RunOutput, timeout_ms: u64) -> ExecutionResult {
    let status = output.status();
    let (passed, error) = match (status, case.expected_output.as_deref()) {
        (ExecutionStatus::Success, Some(expected)) => (validate(expected, &output.stdout), None),
        (ExecutionStatus::Success, None) => (false, Some("no expected output to compare against".to_string())),
        _ => (false, failure_reason(output, timeout_ms)),
    };

    ExecutionResult {
        testcase_id: case.testcase_id,
        actual_output: output.stdout.clone(),
        passed,
        error,
        status,
    }
}

/// Result for a case whose run could not be performed at all
pub fn sandbox_failure(case: &TestCase, message: &str) -> ExecutionResult {
    ExecutionResult {
        testcase_id: case.testcase_id,
        actual_output: String::new(),
        passed: false,
        error: Some(message.to_string()),
        status: ExecutionStatus::RuntimeError,
    }
}

/// Every case fails the same way when the program does not compile
pub fn compile_error_results(cases: &[TestCase], message: &str) -> Vec<ExecutionResult> {
    let message = excerpt(message);
    cases
        .iter()
        .map(|case| ExecutionResult {
            testcase_id: case.testcase_id,
            actual_output: String::new(),
            passed: false,
            error: Some(message.clone()),
            status: ExecutionStatus::CompileError,
        })
        .collect()
}

pub fn tally(results: &[ExecutionResult]) -> Tally {
    let mut tally = Tally::default();
    for result in results {
        tally.record(result.passed);
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ran(stdout: &str, exit_code: Option<i32>) -> RunOutput {
        RunOutput {
            stdout: stdout.to_string(),
            exit_code,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_normalization() {
        assert!(validate("3\n", "3"));
        assert!(!validate("3", "03"));
        assert!(validate("a\nb\n\n", "a\nb"));
        assert!(validate("1 2  \r\n3\t\n", "1 2\n3"));
        assert!(!validate(" 3", "3"));
        assert!(!validate("a\n\nb", "a\nb"));
        assert!(!validate("Yes", "YES"));
        assert!(validate("", "\n\n"));
    }

    #[test]
    fn test_judge_success_and_mismatch() {
        let case = TestCase::new(1, "1 2").with_expected("3\n");
        let passed = judge(&case, &ran("3", Some(0)), 1000);
        assert!(passed.passed);
        assert_eq!(passed.status, ExecutionStatus::Success);
        assert_eq!(passed.error, None);

        let wrong = judge(&case, &ran("4\n", Some(0)), 1000);
        assert!(!wrong.passed);
        assert_eq!(wrong.status, ExecutionStatus::Success);
        assert_eq!(wrong.actual_output, "4\n");
    }

    #[test]
    fn test_judge_runtime_error_and_timeout() {
        let case = TestCase::new(3, "x").with_expected("1");
        let crashed = judge(
            &case,
            &RunOutput {
                stderr: "Traceback: boom\n".into(),
                exit_code: Some(1),
                ..Default::default()
            },
            1000,
        );
        assert_eq!(crashed.status, ExecutionStatus::RuntimeError);
        assert_eq!(crashed.error.as_deref(), Some("exit code 1: Traceback: boom"));

        let slow = judge(&case, &RunOutput::timed_out_after(1001), 1000);
        assert_eq!(slow.status, ExecutionStatus::Timeout);
        assert!(!slow.passed);
        assert_eq!(slow.error.as_deref(), Some("time limit exceeded (1000ms)"));

        let flood = judge(
            &case,
            &RunOutput {
                stdout: "y\n".repeat(8),
                output_limit_exceeded: true,
                ..Default::default()
            },
            1000,
        );
        assert_eq!(flood.status, ExecutionStatus::RuntimeError);
        assert!(flood.error.as_deref().unwrap().starts_with("output limit exceeded"));
    }

    #[test]
    fn test_missing_expected_output_never_passes() {
        let case = TestCase::new(7, "1");
        let result = judge(&case, &ran("1\n", Some(0)), 1000);
        assert!(!result.passed);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_compile_errors_and_tally() {
        let cases = vec![TestCase::new(1, "a"), TestCase::new(2, "b")];
        let results = compile_error_results(&cases, "main.cpp:1: error\n");
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.status == ExecutionStatus::CompileError && !r.passed));
        assert_eq!(results[0].error.as_deref(), Some("main.cpp:1: error"));

        let t = tally(&results);
        assert_eq!((t.total, t.succeeded, t.failed), (2, 0, 2));
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = "e".repeat(MAX_ERROR_CHARS * 2);
        assert_eq!(excerpt(&long).len(), MAX_ERROR_CHARS + 3);
    }
}
