use std::path::{Path, PathBuf};

use crate::config::LanguageConfig;
use crate::runtime::{CommandSpec, Language, LanguageRunner};

const DEFAULT_COMPILER: &str = "g++";
const BINARY_NAME: &str = "program";

/// C++ language runtime executor
pub struct CppRunner {
    /// Path to the C++ compiler
    compiler_path: String,
    /// Additional compiler flags
    compiler_flags: Vec<String>,
}

impl Default for CppRunner {
    fn default() -> Self {
        Self {
            compiler_path: DEFAULT_COMPILER.to_string(),
            compiler_flags: vec![
                "-std=c++17".to_string(),
                "-O2".to_string(),
                "-pipe".to_string(),
            ],
        }
    }
}

impl CppRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &LanguageConfig) -> Self {
        let mut runner = Self::default();
        if let Some(path) = &config.compiler_path {
            runner.compiler_path = path.clone();
        }
        if !config.extra_args.is_empty() {
            runner.compiler_flags = config.extra_args.clone();
        }
        runner
    }

    fn binary_path(workdir: &Path) -> PathBuf {
        workdir.join(BINARY_NAME)
    }
}

impl LanguageRunner for CppRunner {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn source_file_name(&self, _code: &str) -> String {
        "main.cpp".to_string()
    }

    fn wrap(&self, code: &str) -> String {
        // Keeps compiler diagnostics pointing at the contestant's own line numbers.
        format!("#line 1 \"submission.cpp\"\n{}\n", code)
    }

    fn compile_command(&self, source: &Path, workdir: &Path) -> Option<CommandSpec> {
        Some(
            CommandSpec::new(&self.compiler_path)
                .args(&self.compiler_flags)
                .arg("-o")
                .arg(Self::binary_path(workdir))
                .arg(source),
        )
    }

    fn run_command(&self, _source: &Path, workdir: &Path) -> CommandSpec {
        CommandSpec::new(Self::binary_path(workdir).to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_then_run_same_binary() {
        let runner = CppRunner::new();
        let workdir = Path::new("/scratch/cpp-1");
        let source = workdir.join("main.cpp");

        let compile = runner.compile_command(&source, workdir).unwrap();
        assert_eq!(compile.program, "g++");
        assert!(compile.args.contains(&"/scratch/cpp-1/program".to_string()));

        let run = runner.run_command(&source, workdir);
        assert_eq!(run.program, "/scratch/cpp-1/program");
        assert!(run.args.is_empty());
    }

    #[test]
    fn test_wrap_resets_line_numbers() {
        let wrapped = CppRunner::default().wrap("int main() {}");
        assert!(wrapped.starts_with("#line 1"));
        assert!(wrapped.contains("int main() {}"));
    }
}
