use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use quiz_sandbox::config::{EngineConfig, RateLimitConfig};
use quiz_sandbox::runtime::{CommandSpec, Language, LanguageRunner, RuntimeRegistry, TestCase};
use quiz_sandbox::{ErrorKind, ExecutionRequest, ExecutionService};

/// Runs submissions as POSIX shell scripts, so these tests need no language toolchain.
struct ShellRunner;

impl LanguageRunner for ShellRunner {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file_name(&self, _code: &str) -> String {
        "main.sh".to_string()
    }

    fn wrap(&self, code: &str) -> String {
        code.to_string()
    }

    fn compile_command(&self, _source: &Path, _workdir: &Path) -> Option<CommandSpec> {
        None
    }

    fn run_command(&self, source: &Path, _workdir: &Path) -> CommandSpec {
        CommandSpec::new("sh").arg(source)
    }
}

fn has_program(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        scratch_dir: dir.join("scratch"),
        ..EngineConfig::default()
    }
}

fn shell_service(config: EngineConfig) -> ExecutionService {
    let mut registry = RuntimeRegistry::new();
    registry.register(Box::new(ShellRunner));
    ExecutionService::with_registry(config, registry).unwrap()
}

fn scratch_is_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir.join("scratch")) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn test_oversized_code_is_rejected_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { max_code_bytes: 64, ..test_config(dir.path()) };
    let service = shell_service(config);

    let code = format!("echo {}", "x".repeat(100));
    let result = service.execute_code(&code, "python", None, None, Some("alice")).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
    assert!(result.error.is_some());
    assert_eq!(service.sandbox().spawn_count(), 0);
}

#[tokio::test]
async fn test_filtered_code_never_touches_disk() {
    let dir = tempfile::tempdir().unwrap();
    let service = shell_service(test_config(dir.path()));

    let result = service
        .execute_code("import subprocess\nsubprocess.run(['id'])", "python", None, None, None)
        .await;

    assert_eq!(result.error_kind, Some(ErrorKind::SecurityViolation));
    assert_eq!(service.sandbox().spawn_count(), 0);
    assert!(!dir.path().join("scratch").exists());
}

#[tokio::test]
async fn test_quota_plus_one_is_rejected_then_window_resets() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        rate_limit: RateLimitConfig { max_requests: 3, window_secs: 1 },
        ..test_config(dir.path())
    };
    let service = shell_service(config);

    for _ in 0..3 {
        let result = service.execute_code("echo ok", "python", None, None, Some("alice")).await;
        assert!(result.success, "{:?}", result.error);
    }
    let limited = service.execute_code("echo ok", "python", None, None, Some("alice")).await;
    assert_eq!(limited.error_kind, Some(ErrorKind::RateLimitExceeded));
    let spawned = service.sandbox().spawn_count();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let admitted = service.execute_code("echo ok", "python", None, None, Some("alice")).await;
    assert!(admitted.success);
    assert_eq!(service.sandbox().spawn_count(), spawned + 1);
    // The fresh window has counted exactly this one request.
    assert_eq!(service.rate_limiter().remaining("alice"), 2);
}

#[tokio::test]
async fn test_burst_never_exceeds_concurrency_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { max_concurrency: 2, ..test_config(dir.path()) };
    let service = Arc::new(shell_service(config));

    let mut handles = Vec::new();
    for i in 0..6 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let request = ExecutionRequest::new(format!("sleep 0.2\necho {}", i), "python");
            service.execute(request).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stdout.trim(), i.to_string());
    }
    let stats = service.pool_stats();
    assert!(stats.peak_running <= 2);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn test_runaway_process_is_killed_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let service = shell_service(test_config(dir.path()));

    let request = ExecutionRequest::new("sleep 10", "python").with_time_limit(Duration::from_millis(300));
    let started = std::time::Instant::now();
    let result = service.execute(request).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionTimeout));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(scratch_is_empty(dir.path()));
    assert_eq!(service.resource_stats(), result.stats);
}

#[tokio::test]
async fn test_background_child_holding_stderr_does_not_outlast_limit() {
    let dir = tempfile::tempdir().unwrap();
    let service = shell_service(test_config(dir.path()));

    let request = ExecutionRequest::new("sleep 4 >/dev/null &\necho hi", "python")
        .with_time_limit(Duration::from_millis(300));
    let started = std::time::Instant::now();
    let result = service.execute(request).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.stdout.trim(), "hi");
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_background_children_are_killed_after_normal_exit() {
    if !has_program("pgrep") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let service = shell_service(test_config(dir.path()));

    let result = service
        .execute_code("sleep 97.5 >/dev/null 2>&1 &\necho hi", "python", None, None, None)
        .await;
    assert!(result.success, "{:?}", result.error);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let survivors = std::process::Command::new("pgrep")
        .args(["-f", "sleep 97.5"])
        .output()
        .unwrap();
    let alive = String::from_utf8_lossy(&survivors.stdout).trim().to_string();
    assert!(alive.is_empty(), "left running: {}", alive);
}

#[tokio::test]
async fn test_output_flood_is_cut_off() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { max_output_bytes: 4096, ..test_config(dir.path()) };
    let service = shell_service(config);

    let result = service.execute_code("while :; do echo flood; done", "python", None, None, None).await;

    assert_eq!(result.error_kind, Some(ErrorKind::OutputLimitExceeded));
    assert!(result.stdout.is_empty());
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_failing_case_does_not_abort_batch() {
    let dir = tempfile::tempdir().unwrap();
    let service = shell_service(test_config(dir.path()));
    let cases = vec![
        TestCase::new("", "one"),
        TestCase { time_limit: Some(200), ..TestCase::new("stall\n", "never") },
        TestCase::new("", "ONE"),
    ];
    // Any input line makes the script hang past its limit.
    let code = "read line || true\nif [ -n \"$line\" ]; then sleep 5; fi\necho one";

    let outcomes = service.execute_test_cases(code, "python", &cases, None).await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].passed);
    assert!(!outcomes[1].passed);
    assert!(outcomes[1].error.as_deref().unwrap_or_default().contains("timed out"));
    assert!(outcomes[2].passed);
}

#[tokio::test]
async fn test_two_integer_sum_in_every_language() {
    let dir = tempfile::tempdir().unwrap();
    let service = ExecutionService::new(EngineConfig {
        max_time_limit_ms: 15_000,
        ..test_config(dir.path())
    })
    .unwrap();

    let submissions = [
        ("python", vec!["python3"], "a = int(input())\nb = int(input())\nprint(a + b)\n"),
        (
            "javascript",
            vec!["node"],
            "const rl = require('readline').createInterface({ input: process.stdin });\nconst nums = [];\nrl.on('line', (line) => nums.push(Number(line.trim())));\nrl.on('close', () => console.log(nums[0] + nums[1]));\n",
        ),
        (
            "java",
            vec!["javac", "java"],
            "import java.util.Scanner;\n\npublic class Main {\n    public static void main(String[] args) {\n        Scanner in = new Scanner(System.in);\n        int a = in.nextInt();\n        int b = in.nextInt();\n        System.out.println(a + b);\n    }\n}\n",
        ),
        (
            "cpp",
            vec!["g++"],
            "#include <iostream>\n\nint main() {\n    int a, b;\n    std::cin >> a >> b;\n    std::cout << a + b << std::endl;\n    return 0;\n}\n",
        ),
    ];

    for (language, toolchain, code) in submissions {
        if !toolchain.iter().all(|program| has_program(program)) {
            eprintln!("skipping {}: toolchain not installed", language);
            continue;
        }
        let case = TestCase { time_limit: Some(15_000), ..TestCase::new("2\n3", "5") };
        let outcomes = service.execute_test_cases(code, language, &[case], None).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success, "{}: {:?}", language, outcomes[0].error);
        assert!(outcomes[0].passed, "{} printed {:?}", language, outcomes[0].actual_output);
        assert_eq!(outcomes[0].actual_output, "5");
    }
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn test_bug_fix_that_repairs_every_test() {
    if !has_program("python3") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let service = ExecutionService::new(test_config(dir.path())).unwrap();
    let tests = r#"[
        {"input": "2\n3", "expectedOutput": "5"},
        {"input": "10\n1", "expected_output": "11"},
        {"input": "0\n0", "expectedOutput": "0", "timeLimit": 5000}
    ]"#;

    let validation = service
        .validate_bug_fix(
            "a = int(input())\nb = int(input())\nprint(a - b + 1)\n",
            "a = int(input())\nb = int(input())\nprint(a + b)\n",
            tests,
            "python",
            Some("alice"),
        )
        .await;

    assert!(validation.fixes_applied);
    assert!(validation.tests_pass);
    assert_eq!(validation.improvement_score, 3.0);
    assert!(validation.remaining_issues.is_empty());
}

#[tokio::test]
async fn test_scoring_surface_is_total() {
    let dir = tempfile::tempdir().unwrap();
    let service = shell_service(test_config(dir.path()));
    let a = "def area(width, height):\n    return width * height\n";
    let b = "def area(w, h):\n    result = w * h\n    return result\n";

    let forward = service.analyze_code(a, "python", Some(b));
    let backward = service.analyze_code(b, "python", Some(a));
    assert_eq!(forward.similarity_score, backward.similarity_score);

    for mode in ["exact", "semantic", "compiler", "bugfix", "unknown", ""] {
        for (user, reference) in [(a, b), ("", ""), ("", a), ("((((", "")] {
            let score = service.calculate_partial_score(user, reference, None, "python", mode);
            assert!((0.0..=10.0).contains(&score), "{} scored {}", mode, score);
        }
    }
    assert_eq!(service.sandbox().spawn_count(), 0);
}
