use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bugfix::{self, BugFixValidation};
use crate::config::EngineConfig;
use crate::pool::{PoolStats, WorkerPool};
use crate::rate_limit::RateLimiter;
use crate::resources::{print_resource_report, ResourceMonitor, ResourceStats};
use crate::runtime::{ExecutionRequest, ExecutionResult, Language, RuntimeRegistry, TestCase, TestOutcome};
use crate::runtimes;
use crate::sandbox::{Sandbox, SandboxError};
use crate::scoring::{self, EvaluationMode, ScoreInput};
use crate::semantic::{self, SemanticAnalysis};
use crate::telemetry::Telemetry;

/// Entry point for callers: owns every component for the lifetime of the process.
pub struct ExecutionService {
    config: EngineConfig,
    registry: RuntimeRegistry,
    sandbox: Sandbox,
    rate_limiter: Arc<RateLimiter>,
    pool: WorkerPool,
    monitor: ResourceMonitor,
    telemetry: Telemetry,
}

impl ExecutionService {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let registry = runtimes::init_registry(&config);
        Self::with_registry(config, registry)
    }

    /// Builds the service around a caller-supplied set of language runners.
    pub fn with_registry(config: EngineConfig, registry: RuntimeRegistry) -> Result<Self> {
        config.validate().context("Invalid engine configuration")?;
        info!(
            profile = ?config.profile,
            max_concurrency = config.max_concurrency,
            scratch_dir = ?config.scratch_dir,
            "Starting execution service"
        );

        Ok(Self {
            sandbox: Sandbox::new(config.scratch_dir.clone(), config.sandbox_limits()),
            rate_limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            pool: WorkerPool::new(config.max_concurrency, config.queue_timeout()),
            monitor: ResourceMonitor::new(),
            telemetry: Telemetry::new(),
            registry,
            config,
        })
    }

    /// Runs one submission. Every outcome, including rejections, comes back as a result.
    ///
    /// Language, size, and security checks run first, then the caller's rate limit,
    /// then the wait for a worker slot. Requests without an identity are not throttled.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let mut tracker = self.monitor.track();
        let identity = request.identity.as_deref();

        let runner = match self.registry.resolve(&request.language) {
            Ok(runner) => runner,
            Err(e) => return self.finish(None, identity, ExecutionResult::failed(&e, tracker.stats())),
        };
        let language = runner.language();

        if let Err(e) = self.sandbox.admit(runner, &request.code) {
            return self.finish(Some(language), identity, ExecutionResult::failed(&e, tracker.stats()));
        }

        if let Some(identity) = identity {
            if !self.rate_limiter.is_allowed(identity) {
                let e = SandboxError::RateLimitExceeded(identity.to_string());
                return self.finish(Some(language), Some(identity), ExecutionResult::failed(&e, tracker.stats()));
            }
        }

        let time_limit = self.config.effective_time_limit(request.time_limit_ms);
        debug!(%language, time_limit_ms = time_limit.as_millis() as u64, "Admitted execution request");

        let outcome = self
            .pool
            .submit(self.sandbox.execute(
                runner,
                &request.code,
                request.stdin.as_deref(),
                time_limit,
                &mut tracker,
            ))
            .await;
        let result = outcome.unwrap_or_else(|e| ExecutionResult::failed(&e, tracker.stats()));

        self.rate_limiter.cleanup();
        self.finish(Some(language), identity, result)
    }

    fn finish(&self, language: Option<Language>, identity: Option<&str>, result: ExecutionResult) -> ExecutionResult {
        self.monitor.record(result.stats);
        print_resource_report(&result.stats);
        self.telemetry.record_execution(language, identity, &result);

        match &result.error {
            None => info!(language = ?language, elapsed_ms = result.stats.elapsed_ms, "Execution succeeded"),
            Some(error) => info!(language = ?language, kind = ?result.error_kind, "Execution failed: {}", error),
        }
        result
    }

    pub async fn execute_code(
        &self,
        code: &str,
        language: &str,
        stdin: Option<&str>,
        time_limit_ms: Option<u64>,
        identity: Option<&str>,
    ) -> ExecutionResult {
        self.execute(ExecutionRequest {
            code: code.to_string(),
            language: language.to_string(),
            stdin: stdin.map(str::to_string),
            time_limit_ms,
            identity: identity.map(str::to_string),
        })
        .await
    }

    /// Runs the submission once per test case, in order. A failing case only affects its own outcome.
    pub async fn execute_test_cases(
        &self,
        code: &str,
        language: &str,
        test_cases: &[TestCase],
        identity: Option<&str>,
    ) -> Vec<TestOutcome> {
        let mut outcomes = Vec::with_capacity(test_cases.len());
        for (index, test_case) in test_cases.iter().enumerate() {
            let result = self
                .execute_code(code, language, Some(&test_case.input), test_case.time_limit, identity)
                .await;
            let outcome = TestOutcome::from_result(test_case, result);
            debug!(test = index + 1, passed = outcome.passed, "Test case finished");
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Static analysis only; never spawns a process.
    pub fn analyze_code(&self, code: &str, language: &str, reference: Option<&str>) -> SemanticAnalysis {
        match language.parse::<Language>() {
            Ok(language) => semantic::analyze_code(code, language, reference),
            Err(e) => SemanticAnalysis::empty(e.to_string()),
        }
    }

    /// Partial credit in `[0, 10]`. Unknown modes fall back to similarity scoring.
    pub fn calculate_partial_score(
        &self,
        user_code: &str,
        reference_code: &str,
        test_outcomes: Option<&[TestOutcome]>,
        language: &str,
        mode: &str,
    ) -> f64 {
        let language = match language.parse::<Language>() {
            Ok(language) => language,
            Err(e) => {
                warn!("Scoring with zero credit: {}", e);
                return 0.0;
            }
        };
        let mode = mode.parse::<EvaluationMode>().ok();
        let input = ScoreInput {
            user_code,
            reference_code,
            test_outcomes: test_outcomes.unwrap_or(&[]),
            language,
            mode,
            bug_fix: None,
        };
        scoring::calculate_partial_score(&input)
    }

    /// Runs the original and the fixed code over the same test cases and compares them.
    pub async fn validate_bug_fix(
        &self,
        original_code: &str,
        fixed_code: &str,
        test_cases_json: &str,
        language: &str,
        identity: Option<&str>,
    ) -> BugFixValidation {
        let test_cases = match bugfix::parse_test_cases(test_cases_json) {
            Ok(test_cases) => test_cases,
            Err(e) => {
                warn!("Rejecting bug fix validation: {}", e);
                return BugFixValidation::rejected(format!("Invalid test cases: {}", e));
            }
        };
        if let Err(e) = self.registry.resolve(language) {
            return BugFixValidation::rejected(e.to_string());
        }

        let original = self.execute_test_cases(original_code, language, &test_cases, identity).await;
        let fixed = self.execute_test_cases(fixed_code, language, &test_cases, identity).await;
        bugfix::compare(&original, &fixed)
    }

    /// Statistics from the most recent execution.
    pub fn resource_stats(&self) -> ResourceStats {
        self.monitor.snapshot()
    }

    /// Evicts expired rate limit windows every `cleanup_interval_secs`.
    ///
    /// The service does not start this on its own; a long-running host calls it once
    /// inside its runtime and aborts the handle on shutdown. One-shot callers such as
    /// the CLI rely on the eviction that follows each execution instead.
    pub fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let limiter = self.rate_limiter.clone();
        let period = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        })
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        self.registry.languages()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::sandbox::ErrorKind;

    fn service_in(dir: &std::path::Path) -> ExecutionService {
        let config = EngineConfig {
            scratch_dir: dir.join("scratch"),
            rate_limit: RateLimitConfig { max_requests: 2, window_secs: 60 },
            ..EngineConfig::default()
        };
        ExecutionService::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_language_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());

        let result = service.execute_code("puts 1", "ruby", None, None, Some("alice")).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::UnsupportedLanguage));
        assert_eq!(service.rate_limiter().remaining("alice"), 2);
    }

    #[tokio::test]
    async fn test_rejections_do_not_consume_quota_or_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());

        let result = service
            .execute_code("import os\nos.system('id')", "python", None, None, Some("alice"))
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::SecurityViolation));
        assert_eq!(service.sandbox().spawn_count(), 0);
        assert_eq!(service.rate_limiter().remaining("alice"), 2);
        assert_eq!(service.telemetry().snapshot().recent_events.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());
        assert!(service.rate_limiter().is_allowed("alice"));
        assert!(service.rate_limiter().is_allowed("alice"));

        let result = service.execute_code("print(1)", "python", None, None, Some("alice")).await;

        assert_eq!(result.error_kind, Some(ErrorKind::RateLimitExceeded));
        assert_eq!(service.sandbox().spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_test_cases_degrade_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());

        let validation = service
            .validate_bug_fix("print(1)", "print(2)", "{not json", "python", None)
            .await;

        assert!(!validation.fixes_applied);
        assert_eq!(validation.improvement_score, 0.0);
        assert_eq!(validation.remaining_issues.len(), 1);
        assert_eq!(service.sandbox().spawn_count(), 0);
    }

    #[test]
    fn test_scoring_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());

        assert_eq!(service.calculate_partial_score("x", "x", None, "cobol", "semantic"), 0.0);
        assert_eq!(service.calculate_partial_score("Paris", "paris", None, "python", "exact"), 10.0);
        let analysis = service.analyze_code("x", "brainfuck", None);
        assert!(!analysis.syntax_valid);
        assert_eq!(analysis.suggestions.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_evicts_expired_windows() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            scratch_dir: dir.path().join("scratch"),
            rate_limit: RateLimitConfig { max_requests: 2, window_secs: 1 },
            cleanup_interval_secs: 1,
            ..EngineConfig::default()
        };
        let service = ExecutionService::new(config).unwrap();
        assert!(service.rate_limiter().is_allowed("alice"));
        assert!(service.rate_limiter().is_allowed("bob"));
        assert_eq!(service.rate_limiter().tracked_identities(), 2);

        let cleanup = service.spawn_cleanup_task();
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        cleanup.abort();

        assert_eq!(service.rate_limiter().tracked_identities(), 0);
    }

    #[test]
    fn test_lists_all_languages() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());
        let languages = service.supported_languages();
        for language in Language::ALL {
            assert!(languages.contains(&language));
        }
    }
}
