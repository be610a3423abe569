//! Multi-language execution and scoring engine for untrusted quiz submissions.
//!
//! [`ExecutionService`] is the entry point: it screens submissions, throttles callers,
//! bounds concurrency, runs code in a scratch directory, and scores answers.

pub mod bugfix;
pub mod config;
pub mod linter;
pub mod pool;
pub mod rate_limit;
pub mod resources;
pub mod runtime;
pub mod runtimes;
pub mod sandbox;
pub mod scoring;
pub mod semantic;
pub mod service;
pub mod telemetry;

pub use bugfix::BugFixValidation;
pub use config::EngineConfig;
pub use runtime::{ExecutionRequest, ExecutionResult, Language, TestCase, TestOutcome};
pub use sandbox::{ErrorKind, SandboxError};
pub use scoring::EvaluationMode;
pub use semantic::SemanticAnalysis;
pub use service::ExecutionService;
