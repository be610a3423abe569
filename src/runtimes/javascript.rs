use std::path::Path;

use crate::config::LanguageConfig;
use crate::runtime::{CommandSpec, Language, LanguageRunner};

const DEFAULT_RUNTIME: &str = "node";

// Reports uncaught failures on stderr and sets the exit code without calling
// process.exit, which would cut off stdout still buffered for the pipe.
const HARNESS_PRELUDE: &str = r#"const __sandboxFail = (err) => {
  console.error(err && err.stack ? err.stack : String(err));
  process.exitCode = 1;
};
process.on('uncaughtException', __sandboxFail);
process.on('unhandledRejection', __sandboxFail);
"#;

/// Runs submissions under Node.js.
pub struct JavaScriptRunner {
    runtime: String,
    extra_args: Vec<String>,
}

impl JavaScriptRunner {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            extra_args: vec!["--max-old-space-size=256".to_string()],
        }
    }

    pub fn from_config(config: &LanguageConfig) -> Self {
        let mut runner = Self::new(
            config
                .runtime_path
                .clone()
                .unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
        );
        if !config.extra_args.is_empty() {
            runner.extra_args = config.extra_args.clone();
        }
        runner
    }
}

impl Default for JavaScriptRunner {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

impl LanguageRunner for JavaScriptRunner {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn source_file_name(&self, _code: &str) -> String {
        "main.js".to_string()
    }

    fn wrap(&self, code: &str) -> String {
        format!("{}\n{}\n", HARNESS_PRELUDE, code)
    }

    fn compile_command(&self, _source: &Path, _workdir: &Path) -> Option<CommandSpec> {
        None
    }

    fn run_command(&self, source: &Path, _workdir: &Path) -> CommandSpec {
        CommandSpec::new(&self.runtime)
            .arg("--no-warnings")
            .args(&self.extra_args)
            .arg(source)
    }
}
