use std::path::Path;

use crate::config::LanguageConfig;
use crate::runtime::{CommandSpec, Language, LanguageRunner};

const DEFAULT_INTERPRETER: &str = "python3";

/// Runs submissions under CPython.
///
/// The submission is embedded as a string literal and executed through `exec`, so an
/// uncaught exception becomes a traceback on stderr plus exit code 1, and stdout is
/// flushed on every way out.
pub struct PythonRunner {
    interpreter: String,
    extra_args: Vec<String>,
}

impl PythonRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &LanguageConfig) -> Self {
        Self {
            interpreter: config
                .runtime_path
                .clone()
                .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string()),
            extra_args: config.extra_args.clone(),
        }
    }
}

impl Default for PythonRunner {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPRETER)
    }
}

impl LanguageRunner for PythonRunner {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file_name(&self, _code: &str) -> String {
        "main.py".to_string()
    }

    fn wrap(&self, code: &str) -> String {
        // A JSON string is also a valid Python string literal.
        let literal = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
        format!(
            r#"import sys as _sandbox_sys
import traceback as _sandbox_traceback

_sandbox_source = {literal}
_sandbox_scope = {{"__name__": "__main__", "__builtins__": __builtins__}}
try:
    exec(compile(_sandbox_source, "submission.py", "exec"), _sandbox_scope)
except SystemExit:
    raise
except BaseException:
    _sandbox_traceback.print_exc()
    _sandbox_sys.stdout.flush()
    _sandbox_sys.exit(1)
finally:
    try:
        _sandbox_sys.stdout.flush()
    except BaseException:
        pass
"#
        )
    }

    fn compile_command(&self, _source: &Path, _workdir: &Path) -> Option<CommandSpec> {
        None
    }

    fn run_command(&self, source: &Path, _workdir: &Path) -> CommandSpec {
        CommandSpec::new(&self.interpreter)
            .arg("-I")
            .args(&self.extra_args)
            .arg(source)
    }
}
