use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use quiz_sandbox::bugfix;
use quiz_sandbox::config::{EngineConfig, SystemProfile};
use quiz_sandbox::runtime::Language;
use quiz_sandbox::service::ExecutionService;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// System profile (development, testing, production, custom); overrides the file's presets
    #[arg(long)]
    profile: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file once
    Run {
        #[arg(required = true)]
        file: PathBuf,

        /// Language name; inferred from the file extension when omitted
        #[arg(short, long)]
        language: Option<String>,

        /// Text piped to the program's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Wall-clock limit in milliseconds
        #[arg(long)]
        time_limit: Option<u64>,

        /// Identity the run is rate limited under
        #[arg(long)]
        identity: Option<String>,
    },

    /// Run a source file against a JSON array of test cases
    Test {
        #[arg(required = true)]
        file: PathBuf,

        #[arg(short, long, required = true)]
        tests: PathBuf,

        #[arg(short, long)]
        language: Option<String>,
    },

    /// Static analysis without running anything
    Analyze {
        #[arg(required = true)]
        file: PathBuf,

        /// Reference solution to compare against
        #[arg(short, long)]
        reference: Option<PathBuf>,

        #[arg(short, long)]
        language: Option<String>,
    },

    /// Partial score for an answer
    Score {
        #[arg(required = true)]
        file: PathBuf,

        #[arg(short, long, required = true)]
        reference: PathBuf,

        /// exact, semantic, compiler, or bugfix
        #[arg(short, long, default_value = "semantic")]
        mode: String,

        /// Test cases to run first (compiler and bugfix modes)
        #[arg(short, long)]
        tests: Option<PathBuf>,

        #[arg(short, long)]
        language: Option<String>,
    },

    /// Compare a buggy submission with its fix over shared test cases
    Bugfix {
        #[arg(required = true)]
        original: PathBuf,

        #[arg(required = true)]
        fixed: PathBuf,

        #[arg(short, long, required = true)]
        tests: PathBuf,

        #[arg(short, long)]
        language: Option<String>,
    },

    /// List supported languages
    ListSupported,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(profile) = &cli.profile {
        config.profile = profile.parse::<SystemProfile>()?;
        config.apply_profile();
    }
    setup_logging(&config, cli.verbose);
    debug!("Loaded configuration: {:?}", config);

    let service = ExecutionService::new(config)?;

    match cli.command {
        Commands::Run { file, language, stdin, time_limit, identity } => {
            let language = resolve_language(&file, language)?;
            let code = read_source(&file)?;
            let result = service
                .execute_code(&code, &language, stdin.as_deref(), time_limit, identity.as_deref())
                .await;
            print_json(&result)?;
        }

        Commands::Test { file, tests, language } => {
            let language = resolve_language(&file, language)?;
            let code = read_source(&file)?;
            let test_cases = bugfix::parse_test_cases(&read_source(&tests)?)
                .with_context(|| format!("Invalid test cases in {:?}", tests))?;
            let outcomes = service.execute_test_cases(&code, &language, &test_cases, None).await;
            print_json(&outcomes)?;
        }

        Commands::Analyze { file, reference, language } => {
            let language = resolve_language(&file, language)?;
            let code = read_source(&file)?;
            let reference = reference.as_deref().map(read_source).transpose()?;
            let analysis = service.analyze_code(&code, &language, reference.as_deref());
            print_json(&analysis)?;
        }

        Commands::Score { file, reference, mode, tests, language } => {
            let language = resolve_language(&file, language)?;
            let code = read_source(&file)?;
            let reference_code = read_source(&reference)?;
            let outcomes = match tests {
                Some(tests) => {
                    let test_cases = bugfix::parse_test_cases(&read_source(&tests)?)
                        .with_context(|| format!("Invalid test cases in {:?}", tests))?;
                    Some(service.execute_test_cases(&code, &language, &test_cases, None).await)
                }
                None => None,
            };
            let score = service.calculate_partial_score(
                &code,
                &reference_code,
                outcomes.as_deref(),
                &language,
                &mode,
            );
            print_json(&serde_json::json!({ "mode": mode, "score": score, "testOutcomes": outcomes }))?;
        }

        Commands::Bugfix { original, fixed, tests, language } => {
            let language = resolve_language(&fixed, language)?;
            let original_code = read_source(&original)?;
            let fixed_code = read_source(&fixed)?;
            let test_cases_json = read_source(&tests)?;
            let validation = service
                .validate_bug_fix(&original_code, &fixed_code, &test_cases_json, &language, None)
                .await;
            print_json(&validation)?;
        }

        Commands::ListSupported => {
            let languages: Vec<&str> = service
                .supported_languages()
                .iter()
                .map(|language| language.name())
                .collect();
            print_json(&languages)?;
        }
    }

    Ok(())
}

fn setup_logging(config: &EngineConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read file: {:?}", path))
}

/// Uses the explicit language if given, otherwise guesses from the extension.
fn resolve_language(file: &Path, explicit: Option<String>) -> Result<String> {
    if let Some(language) = explicit {
        return Ok(language);
    }
    let extension = file
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| anyhow!("Cannot infer language of {:?}, pass --language", file))?;
    let language = match extension {
        "py" => Language::Python,
        "js" | "mjs" | "cjs" => Language::JavaScript,
        "java" => Language::Java,
        "cpp" | "cc" | "cxx" | "hpp" => Language::Cpp,
        other => return Err(anyhow!("Unsupported file extension '.{}', pass --language", other)),
    };
    Ok(language.name().to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
