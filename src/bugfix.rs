use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::{TestCase, TestOutcome};

/// Improvement credit for turning every failing test into a passing one.
pub const MAX_IMPROVEMENT_SCORE: f64 = 3.0;

/// Differential verdict on a proposed bug fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BugFixValidation {
    /// The fixed code fails strictly fewer tests than the original.
    pub fixes_applied: bool,
    /// The fixed code passes every test.
    pub tests_pass: bool,
    /// 0..=3, proportional to the reduction in failing tests.
    pub improvement_score: f64,
    pub remaining_issues: Vec<String>,
}

impl BugFixValidation {
    /// A verdict that awards nothing and explains why.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            fixes_applied: false,
            tests_pass: false,
            improvement_score: 0.0,
            remaining_issues: vec![reason.into()],
        }
    }
}

/// Parses the JSON array of test cases callers hand in.
pub fn parse_test_cases(json: &str) -> Result<Vec<TestCase>, serde_json::Error> {
    serde_json::from_str(json)
}

fn failures(outcomes: &[TestOutcome]) -> usize {
    outcomes.iter().filter(|outcome| !outcome.passed).count()
}

/// Compares outcomes of the original and the fixed code over the same test cases.
pub fn compare(original: &[TestOutcome], fixed: &[TestOutcome]) -> BugFixValidation {
    let total = original.len().max(fixed.len());
    if total == 0 {
        return BugFixValidation::rejected("No test cases were provided");
    }

    let original_failures = failures(original);
    let fixed_failures = failures(fixed);
    let reduction = original_failures.saturating_sub(fixed_failures);

    let remaining_issues: Vec<String> = fixed
        .iter()
        .enumerate()
        .filter(|(_, outcome)| !outcome.passed)
        .map(|(index, outcome)| describe_failure(index, outcome))
        .collect();

    debug!(
        original_failures,
        fixed_failures, total, "Compared original and fixed submissions"
    );

    BugFixValidation {
        fixes_applied: fixed_failures < original_failures,
        tests_pass: fixed.len() == total && fixed_failures == 0,
        improvement_score: MAX_IMPROVEMENT_SCORE * reduction as f64 / total as f64,
        remaining_issues,
    }
}

/// Verdict from the fixed code's outcomes alone, taking the original as failing every test.
pub fn from_fixed_outcomes(fixed: &[TestOutcome]) -> BugFixValidation {
    let assumed_original: Vec<TestOutcome> = fixed
        .iter()
        .cloned()
        .map(|outcome| TestOutcome { passed: false, ..outcome })
        .collect();
    compare(&assumed_original, fixed)
}

fn describe_failure(index: usize, outcome: &TestOutcome) -> String {
    match &outcome.error {
        Some(error) => format!("Test {} failed: {}", index + 1, error),
        None => format!(
            "Test {} failed: expected '{}', got '{}'",
            index + 1,
            outcome.test_case.expected_output.trim(),
            outcome.actual_output
        ),
    }
}
