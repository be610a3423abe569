use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::bugfix::{self, BugFixValidation};
use crate::runtime::{normalize_output, Language, TestOutcome};
use crate::semantic::{self, MAX_SIMILARITY_SCORE};

pub const MAX_SCORE: f64 = 10.0;

const SYNTAX_BONUS: f64 = 2.0;
const STRUCTURE_WEIGHT: f64 = 0.4;
const KEYWORD_WEIGHT: f64 = 0.2;
const SIMILARITY_WEIGHT: f64 = 0.8;

const PASS_RATE_WEIGHT: f64 = 7.0;
const LENGTH_RATIO_RANGE: (f64, f64) = (0.5, 2.0);

const FIXES_APPLIED_CREDIT: f64 = 3.0;
const TESTS_PASS_CREDIT: f64 = 4.0;

/// How a question's answers are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    Exact,
    Semantic,
    Compiler,
    Bugfix,
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvaluationMode::Exact => "exact",
            EvaluationMode::Semantic => "semantic",
            EvaluationMode::Compiler => "compiler",
            EvaluationMode::Bugfix => "bugfix",
        };
        f.write_str(name)
    }
}

impl FromStr for EvaluationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(EvaluationMode::Exact),
            "semantic" => Ok(EvaluationMode::Semantic),
            "compiler" => Ok(EvaluationMode::Compiler),
            "bugfix" | "bug-fix" | "bug_fix" => Ok(EvaluationMode::Bugfix),
            other => Err(format!("Unknown evaluation mode '{}'", other)),
        }
    }
}

/// Everything the scorer looks at for one answer.
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub user_code: &'a str,
    pub reference_code: &'a str,
    pub test_outcomes: &'a [TestOutcome],
    pub language: Language,
    /// `None` selects the similarity-only fallback.
    pub mode: Option<EvaluationMode>,
    /// Result of a differential run, used in bugfix mode.
    pub bug_fix: Option<&'a BugFixValidation>,
}

impl<'a> ScoreInput<'a> {
    pub fn new(user_code: &'a str, reference_code: &'a str, language: Language) -> Self {
        Self {
            user_code,
            reference_code,
            test_outcomes: &[],
            language,
            mode: None,
            bug_fix: None,
        }
    }

    pub fn mode(mut self, mode: EvaluationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn outcomes(mut self, outcomes: &'a [TestOutcome]) -> Self {
        self.test_outcomes = outcomes;
        self
    }

    pub fn bug_fix(mut self, validation: &'a BugFixValidation) -> Self {
        self.bug_fix = Some(validation);
        self
    }
}

/// Whitespace-normalized, case-insensitive equality.
pub fn exact_match(answer: &str, key: &str) -> bool {
    normalize_output(answer) == normalize_output(key)
}

/// Partial credit in `[0, 10]` for one answer.
pub fn calculate_partial_score(input: &ScoreInput<'_>) -> f64 {
    let raw = match input.mode {
        Some(EvaluationMode::Exact) if exact_match(input.user_code, input.reference_code) => MAX_SCORE,
        Some(EvaluationMode::Exact) | None => similarity_fallback(input),
        Some(EvaluationMode::Semantic) => semantic_score(input),
        Some(EvaluationMode::Compiler) => compiler_score(input),
        Some(EvaluationMode::Bugfix) => match input.bug_fix {
            Some(validation) => bugfix_score(validation),
            None => bugfix_score(&bugfix::from_fixed_outcomes(input.test_outcomes)),
        },
    };
    clamp_score(raw)
}

/// Coerces non-finite values to zero, then clamps into `[0, 10]`.
pub fn clamp_score(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, MAX_SCORE)
    } else {
        0.0
    }
}

fn similarity_fallback(input: &ScoreInput<'_>) -> f64 {
    let similarity = semantic::token_similarity(input.user_code, input.reference_code) * MAX_SIMILARITY_SCORE;
    (similarity * 2.0).min(MAX_SCORE)
}

fn semantic_score(input: &ScoreInput<'_>) -> f64 {
    let analysis = semantic::analyze_code(input.user_code, input.language, Some(input.reference_code));
    let syntax = if analysis.syntax_valid { SYNTAX_BONUS } else { 0.0 };
    syntax
        + f64::from(analysis.structure_score) * STRUCTURE_WEIGHT
        + f64::from(analysis.keyword_score) * KEYWORD_WEIGHT
        + analysis.similarity_score * SIMILARITY_WEIGHT
}

fn compiler_score(input: &ScoreInput<'_>) -> f64 {
    pass_rate(input.test_outcomes) * PASS_RATE_WEIGHT + quality_bonus(input)
}

pub fn pass_rate(outcomes: &[TestOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let passed = outcomes.iter().filter(|outcome| outcome.passed).count();
    passed as f64 / outcomes.len() as f64
}

/// Up to three points for sensible length, decomposition, and error handling.
fn quality_bonus(input: &ScoreInput<'_>) -> f64 {
    let features = semantic::extract_features(input.user_code, input.language);
    let mut bonus = 0.0;

    let user_len = input.user_code.trim().len() as f64;
    let reference_len = input.reference_code.trim().len() as f64;
    if reference_len > 0.0 {
        let ratio = user_len / reference_len;
        if ratio >= LENGTH_RATIO_RANGE.0 && ratio <= LENGTH_RATIO_RANGE.1 {
            bonus += 1.0;
        }
    }
    if features.functions > 0 {
        bonus += 1.0;
    }
    if features.error_handling > 0 {
        bonus += 1.0;
    }
    bonus
}

pub fn bugfix_score(validation: &BugFixValidation) -> f64 {
    let mut score = validation.improvement_score;
    if validation.fixes_applied {
        score += FIXES_APPLIED_CREDIT;
    }
    if validation.tests_pass {
        score += TESTS_PASS_CREDIT;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TestCase;

    const REFERENCE: &str = "def add(a, b):\n    return a + b\n\nprint(add(int(input()), int(input())))\n";

    fn outcomes(passed: usize, total: usize) -> Vec<TestOutcome> {
        (0..total)
            .map(|i| TestOutcome {
                test_case: TestCase::new("", "1"),
                actual_output: "1".to_string(),
                success: true,
                passed: i < passed,
                elapsed_ms: 0,
                memory_bytes: 0,
                error: None,
            })
            .collect()
    }

    #[test]
    fn test_exact_mode() {
        let input = ScoreInput::new("  Paris\n", "paris", Language::Python).mode(EvaluationMode::Exact);
        assert_eq!(calculate_partial_score(&input), MAX_SCORE);

        let input = ScoreInput::new("London", "paris", Language::Python).mode(EvaluationMode::Exact);
        assert_eq!(calculate_partial_score(&input), 0.0);
    }

    #[test]
    fn test_identical_semantic_answer_scores_high() {
        let input = ScoreInput::new(REFERENCE, REFERENCE, Language::Python).mode(EvaluationMode::Semantic);
        let score = calculate_partial_score(&input);
        assert!(score >= 7.0, "score was {}", score);
        assert!(score <= MAX_SCORE);
    }

    #[test]
    fn test_compiler_score_monotonic_in_pass_rate() {
        let mut previous = -1.0;
        for passed in 0..=5 {
            let results = outcomes(passed, 5);
            let input = ScoreInput::new(REFERENCE, REFERENCE, Language::Python)
                .mode(EvaluationMode::Compiler)
                .outcomes(&results);
            let score = calculate_partial_score(&input);
            assert!(score >= previous, "{} < {} at {} passed", score, previous, passed);
            previous = score;
        }
        assert!(previous >= PASS_RATE_WEIGHT);
    }

    #[test]
    fn test_bugfix_credit_adds_up() {
        let validation = BugFixValidation {
            fixes_applied: true,
            tests_pass: true,
            improvement_score: 3.0,
            remaining_issues: Vec::new(),
        };
        let input = ScoreInput::new("", "", Language::Java)
            .mode(EvaluationMode::Bugfix)
            .bug_fix(&validation);
        assert_eq!(calculate_partial_score(&input), MAX_SCORE);
    }

    #[test]
    fn test_bugfix_without_validation_uses_outcomes() {
        let results = outcomes(2, 2);
        let input = ScoreInput::new("x", "y", Language::Cpp)
            .mode(EvaluationMode::Bugfix)
            .outcomes(&results);
        assert_eq!(calculate_partial_score(&input), MAX_SCORE);
    }

    #[test]
    fn test_default_mode_is_doubled_similarity() {
        let input = ScoreInput::new("alpha beta gamma", "alpha beta delta", Language::JavaScript);
        // Jaccard 2/4 scaled to five, then doubled.
        assert_eq!(calculate_partial_score(&input), 5.0);
    }

    #[test]
    fn test_scores_stay_in_range_for_degenerate_input() {
        let empty: Vec<TestOutcome> = Vec::new();
        for mode in [
            None,
            Some(EvaluationMode::Exact),
            Some(EvaluationMode::Semantic),
            Some(EvaluationMode::Compiler),
            Some(EvaluationMode::Bugfix),
        ] {
            for (user, reference) in [("", ""), ("", "x"), ("{{{{", ""), ("\u{0}\u{0}", "((((")] {
                let input = ScoreInput {
                    user_code: user,
                    reference_code: reference,
                    test_outcomes: &empty,
                    language: Language::Python,
                    mode,
                    bug_fix: None,
                };
                let score = calculate_partial_score(&input);
                assert!((0.0..=MAX_SCORE).contains(&score), "{:?} gave {}", mode, score);
            }
        }
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(f64::INFINITY), 0.0);
        assert_eq!(clamp_score(42.0), MAX_SCORE);
    }

    #[test]
    fn test_mode_names_parse() {
        assert_eq!("Compiler".parse::<EvaluationMode>().unwrap(), EvaluationMode::Compiler);
        assert_eq!("bug-fix".parse::<EvaluationMode>().unwrap(), EvaluationMode::Bugfix);
        assert!("essay".parse::<EvaluationMode>().is_err());
    }
}
