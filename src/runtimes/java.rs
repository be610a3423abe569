use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

use crate::config::LanguageConfig;
use crate::runtime::{CommandSpec, Language, LanguageRunner};

const DEFAULT_COMPILER: &str = "javac";
const DEFAULT_RUNTIME: &str = "java";
const DEFAULT_CLASS: &str = "Main";

lazy_static! {
    static ref PUBLIC_CLASS: Regex = Regex::new(r"\bpublic\s+(?:final\s+|abstract\s+)*class\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref ANY_CLASS: Regex = Regex::new(r"\bclass\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref MAIN_METHOD: Regex = Regex::new(r"\bstatic\s+(?:final\s+)?void\s+main\s*\(").unwrap();
    static ref COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/|//[^\n]*").unwrap();
}

/// Compiles with `javac` and runs the resulting class on the JVM.
pub struct JavaRunner {
    compiler: String,
    runtime: String,
    jvm_args: Vec<String>,
}

impl JavaRunner {
    pub fn new(compiler: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            compiler: compiler.into(),
            runtime: runtime.into(),
            jvm_args: vec![
                "-Xmx256m".to_string(),
                "-Xss64m".to_string(),
                "-XX:+UseSerialGC".to_string(),
            ],
        }
    }

    pub fn from_config(config: &LanguageConfig) -> Self {
        let mut runner = Self::new(
            config
                .compiler_path
                .clone()
                .unwrap_or_else(|| DEFAULT_COMPILER.to_string()),
            config
                .runtime_path
                .clone()
                .unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
        );
        if !config.extra_args.is_empty() {
            runner.jvm_args = config.extra_args.clone();
        }
        runner
    }

    /// The class the JVM is started with: the public class if there is one,
    /// otherwise the class declaring `main`, otherwise the first class declared.
    /// Comments are ignored.
    pub fn entry_class(code: &str) -> String {
        let code = COMMENT.replace_all(code, " ");
        if let Some(name) = PUBLIC_CLASS.captures(&code).and_then(|caps| caps.get(1)) {
            return name.as_str().to_string();
        }

        let declarations: Vec<_> = ANY_CLASS.captures_iter(&code).collect();
        let with_main = declarations.iter().enumerate().find(|(index, caps)| {
            let body_start = caps.get(0).map_or(0, |m| m.end());
            let body_end = declarations
                .get(index + 1)
                .and_then(|next| next.get(0))
                .map_or(code.len(), |m| m.start());
            MAIN_METHOD.is_match(&code[body_start..body_end])
        });

        with_main
            .map(|(_, caps)| caps)
            .or_else(|| declarations.first())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_CLASS.to_string())
    }
}

impl Default for JavaRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMPILER, DEFAULT_RUNTIME)
    }
}

impl LanguageRunner for JavaRunner {
    fn language(&self) -> Language {
        Language::Java
    }

    fn source_file_name(&self, code: &str) -> String {
        // javac insists that a public class lives in a file of the same name.
        format!("{}.java", Self::entry_class(code))
    }

    fn wrap(&self, code: &str) -> String {
        code.to_string()
    }

    fn compile_command(&self, source: &Path, workdir: &Path) -> Option<CommandSpec> {
        Some(
            CommandSpec::new(&self.compiler)
                .args(["-encoding", "UTF-8", "-nowarn", "-d"])
                .arg(workdir)
                .arg(source),
        )
    }

    fn run_command(&self, source: &Path, workdir: &Path) -> CommandSpec {
        let class = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_CLASS.to_string());
        CommandSpec::new(&self.runtime)
            .args(&self.jvm_args)
            .arg("-cp")
            .arg(workdir)
            .arg(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_class_prefers_public_class() {
        let code = "class Helper {}\npublic final class Solution { public static void main(String[] a) {} }";
        assert_eq!(JavaRunner::entry_class(code), "Solution");
        assert_eq!(JavaRunner::entry_class("class Foo { }"), "Foo");
        assert_eq!(JavaRunner::entry_class("// nothing here"), "Main");
    }

    #[test]
    fn test_entry_class_follows_main_without_public_class() {
        let code = "// this class reads two numbers\n\
                    class Helper { static int add(int a, int b) { return a + b; } }\n\
                    class Solution {\n    public static void main(String[] args) {}\n}\n";
        assert_eq!(JavaRunner::entry_class(code), "Solution");
        assert_eq!(JavaRunner::entry_class("/* class Fake */ class Real { }"), "Real");
    }

    #[test]
    fn test_commands_share_workdir_and_class() {
        let runner = JavaRunner::default();
        let code = "public class Main { public static void main(String[] a) {} }";
        let workdir = Path::new("/scratch/java-1");
        let source = workdir.join(runner.source_file_name(code));

        let compile = runner.compile_command(&source, workdir).unwrap();
        assert_eq!(compile.program, "javac");
        assert!(compile.args.ends_with(&["-d".to_string(), "/scratch/java-1".to_string(), "/scratch/java-1/Main.java".to_string()]));

        let run = runner.run_command(&source, workdir);
        assert_eq!(run.program, "java");
        assert_eq!(run.args.last().map(String::as_str), Some("Main"));
    }
}
