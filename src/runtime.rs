use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::linter;
use crate::resources::ResourceStats;
use crate::sandbox::{ErrorKind, SandboxError};

/// The fixed set of languages a submission may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    Java,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::Python,
        Language::Java,
        Language::Cpp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "python" | "py" | "python3" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// A single request to run untrusted code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub identity: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            stdin: None,
            time_limit_ms: None,
            identity: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ms = Some(limit.as_millis() as u64);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

/// The outcome of one admitted or rejected execution request.
///
/// Always fully populated: failure paths set `success = false` together with
/// `error` and `error_kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub stats: ResourceStats,
}

impl ExecutionResult {
    pub fn completed(stdout: String, stderr: String, exit_code: i32, stats: ResourceStats) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            exit_code: Some(exit_code),
            error: None,
            error_kind: None,
            stats,
        }
    }

    pub fn failed(error: &SandboxError, stats: ResourceStats) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            stats,
        }
    }

    /// A failed run that still produced output worth keeping (non-zero exit).
    pub fn failed_with_output(
        error: &SandboxError,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        stats: ResourceStats,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            ..Self::failed(error, stats)
        }
    }
}

/// Input and expected output for one test of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    #[serde(alias = "expected_output", alias = "expected")]
    pub expected_output: String,
    #[serde(default, alias = "time_limit", alias = "timeLimitMs")]
    pub time_limit: Option<u64>,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            time_limit: None,
        }
    }
}

/// A test case together with what actually happened when it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub test_case: TestCase,
    pub actual_output: String,
    pub success: bool,
    pub passed: bool,
    pub elapsed_ms: u64,
    pub memory_bytes: u64,
    pub error: Option<String>,
}

impl TestOutcome {
    pub fn from_result(test_case: &TestCase, result: ExecutionResult) -> Self {
        let passed = result.success && outputs_match(&result.stdout, &test_case.expected_output);
        Self {
            test_case: test_case.clone(),
            actual_output: normalize_output(&result.stdout),
            success: result.success,
            passed,
            elapsed_ms: result.stats.elapsed_ms,
            memory_bytes: result.stats.peak_memory_bytes,
            error: result.error,
        }
    }
}

/// Collapses runs of whitespace, trims, and lower-cases program output.
pub fn normalize_output(output: &str) -> String {
    output
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// A program invocation: executable plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }
}

/// Per-language adapter: how to wrap, compile, and run a submission.
pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> Language;

    /// File name the wrapped source is written under inside the scratch directory.
    fn source_file_name(&self, code: &str) -> String;

    /// Surrounds user code with the harness for this runtime.
    fn wrap(&self, code: &str) -> String;

    /// Compiler invocation, `None` for interpreted languages.
    fn compile_command(&self, source: &Path, workdir: &Path) -> Option<CommandSpec>;

    fn run_command(&self, source: &Path, workdir: &Path) -> CommandSpec;

    /// Performs language-specific screening of the raw submission.
    fn lint_code(&self, content: &str) -> Result<(), SandboxError> {
        linter::check_for_dangerous_code(content, self.language())
    }
}

/// Registry for storing and retrieving language runners
pub struct RuntimeRegistry {
    runners: Vec<Box<dyn LanguageRunner>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self { runners: Vec::new() }
    }

    pub fn register(&mut self, runner: Box<dyn LanguageRunner>) {
        self.runners.retain(|existing| existing.language() != runner.language());
        self.runners.push(runner);
    }

    pub fn get(&self, language: Language) -> Option<&dyn LanguageRunner> {
        self.runners
            .iter()
            .find(|runner| runner.language() == language)
            .map(|boxed| boxed.as_ref())
    }

    /// Resolves a declared language name to its runner.
    pub fn resolve(&self, language: &str) -> Result<&dyn LanguageRunner, SandboxError> {
        let parsed: Language = language.parse()?;
        self.get(parsed)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
    }

    pub fn languages(&self) -> Vec<Language> {
        self.runners.iter().map(|runner| runner.language()).collect()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
