use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::runtime::Language;
use crate::sandbox::SandboxError;

/// A forbidden construct and the reason it is rejected.
struct DangerousPattern {
    regex: Regex,
    description: &'static str,
}

// Shell and administration commands that have no place in a quiz answer,
// whatever language they are smuggled through.
const COMMON_PATTERNS: &[(&str, &str)] = &[
    (r"\bsudo\b", "Privilege escalation"),
    (r"\brm\s+-rf\b", "Recursive file deletion"),
    (r"\bchmod\s+[0-7]{3,4}\b", "Permission change"),
    (r"\bchown\s+\w", "Ownership change"),
    (r"\bkillall\b", "Host process termination"),
    (r"\bshutdown\s+-", "System shutdown"),
    (r"\breboot\b", "System reboot"),
    (r"\bmkfs\b", "Filesystem formatting"),
    (r"/etc/(passwd|shadow|sudoers)", "Access to system credentials"),
    (r"/proc/self", "Access to process internals"),
];

const PYTHON_PATTERNS: &[(&str, &str)] = &[
    (r"\bos\.system\b", "Direct system command execution"),
    (r"\bsubprocess\b", "Subprocess execution"),
    (r"\bos\.(popen|spawn\w*|exec\w*|fork|kill\w*|remove|unlink|rmdir|chmod|chown|setuid)\b", "OS level process or file operation"),
    (r"\bimport\s+os\b", "OS module import"),
    (r"\bfrom\s+os\b", "OS module import"),
    (r"\b(import|from)\s+(shutil|pathlib|ctypes|pty|multiprocessing|signal)\b", "Restricted module import"),
    (r"\b(import|from)\s+(socket|urllib\w*|requests|http|ftplib|smtplib|telnetlib)\b", "Network operations"),
    (r"\beval\s*\(", "Dynamic code evaluation via eval()"),
    (r"\bexec\s*\(", "Dynamic code execution via exec()"),
    (r"(^|[^.\w])compile\s*\(", "Dynamic code compilation"),
    (r"__import__", "Dynamic module importing"),
    (r"\bimportlib\b", "Dynamic module importing"),
    (r"\bopen\s*\(", "File system access"),
    (r"__builtins__|__subclasses__|__globals__", "Interpreter internals access"),
];

const JAVASCRIPT_PATTERNS: &[(&str, &str)] = &[
    (r"child_process", "Node.js child process module"),
    (r"\b(execSync|execFile\w*|spawnSync)\b", "Process execution"),
    (r"\.spawn\s*\(", "Process execution"),
    (r#"\brequire\s*\(\s*['"`](node:)?(fs|fs/promises|net|http|https|http2|dgram|dns|tls|cluster|worker_threads|vm|os|v8|inspector)['"`]"#, "Restricted Node.js module"),
    (r#"\bfrom\s+['"`](node:)?(fs|fs/promises|net|http|https|http2|dgram|dns|tls|cluster|worker_threads|vm|os)['"`]"#, "Restricted Node.js module"),
    (r#"\bimport\s*\(\s*['"`]"#, "Dynamic module importing"),
    (r"\beval\s*\(", "Dynamic code evaluation via eval()"),
    (r"\bnew\s+Function\b", "Dynamic code via Function constructor"),
    (r"\bprocess\.(exit|kill|abort|binding|dlopen|env|chdir|setuid|setgid)\b", "Process control"),
    (r"\b(fetch|XMLHttpRequest|WebSocket)\b", "Network operations"),
    (r"\bglobalThis\.process\b", "Process control"),
];

const JAVA_PATTERNS: &[(&str, &str)] = &[
    (r"\bRuntime\s*\.\s*getRuntime\b", "Process execution via Runtime"),
    (r"\bProcessBuilder\b", "Process execution via ProcessBuilder"),
    (r"\bProcessHandle\b", "Process control"),
    (r"\bjava\.io\.File\b", "File system access"),
    (r"\bnew\s+(File|FileReader|FileWriter|FileInputStream|FileOutputStream|RandomAccessFile)\b", "File system access"),
    (r"\bjava\.nio\.(file|channels)\b", "File system access"),
    (r"\bFiles\s*\.\s*\w+\s*\(", "File system access"),
    (r"\bjava\.net\b", "Network operations"),
    (r"\b(Server)?Socket\s*\(", "Network operations"),
    (r"\bSystem\s*\.\s*(exit|setSecurityManager|load|loadLibrary)\b", "JVM control"),
    (r"\bClass\s*\.\s*forName\b", "Reflective class loading"),
    (r"\bjava\.lang\.reflect\b", "Reflection"),
    (r"\bsetAccessible\b", "Reflection"),
    (r"\bjavax\.script\b", "Dynamic code evaluation"),
    (r"\bsun\.misc\.Unsafe\b", "Unsafe memory access"),
];

const CPP_PATTERNS: &[(&str, &str)] = &[
    (r"\bsystem\s*\(", "Direct system command execution"),
    (r"\bpopen\s*\(", "Process execution"),
    (r"\b(v?fork|clone)\s*\(", "Process creation"),
    (r"\bexec(l|lp|le|v|vp|vpe|ve)\s*\(", "Process execution"),
    (r"\bkill\s*\(", "Process termination"),
    (r"\bsyscall\s*\(", "Raw system call"),
    (r"\bdlopen\s*\(", "Dynamic library loading"),
    (r"#\s*include\s*<\s*(unistd\.h|sys/\w+\.h|netinet/\w+\.h|arpa/inet\.h|netdb\.h|dirent\.h|fcntl\.h|signal\.h|csignal|spawn\.h|dlfcn\.h)\s*>", "Restricted system header"),
    (r"#\s*include\s*<\s*(fstream|filesystem)\s*>", "File system access"),
    (r"\b(fopen|freopen|open|creat|unlink|rmdir|rename)\s*\(", "File system access"),
    (r"\b(i|o)?fstream\b", "File system access"),
    (r"\bstd::filesystem\b", "File system access"),
    (r"\bsocket\s*\(", "Network operations"),
    (r"\b(__asm__|asm)\s*(volatile\s*)?\(", "Inline assembly"),
];

lazy_static! {
    static ref COMMON: Vec<DangerousPattern> = compile_patterns(COMMON_PATTERNS);
    static ref PYTHON: Vec<DangerousPattern> = compile_patterns(PYTHON_PATTERNS);
    static ref JAVASCRIPT: Vec<DangerousPattern> = compile_patterns(JAVASCRIPT_PATTERNS);
    static ref JAVA: Vec<DangerousPattern> = compile_patterns(JAVA_PATTERNS);
    static ref CPP: Vec<DangerousPattern> = compile_patterns(CPP_PATTERNS);
}

fn compile_patterns(patterns: &[(&str, &'static str)]) -> Vec<DangerousPattern> {
    patterns
        .iter()
        .filter_map(|(pattern, description)| {
            match Regex::new(&format!("(?i){}", pattern)) {
                Ok(regex) => Some(DangerousPattern { regex, description }),
                Err(e) => {
                    warn!("Invalid regex pattern {}: {}", pattern, e);
                    None
                }
            }
        })
        .collect()
}

fn patterns_for(language: Language) -> &'static [DangerousPattern] {
    match language {
        Language::Python => &PYTHON,
        Language::JavaScript => &JAVASCRIPT,
        Language::Java => &JAVA,
        Language::Cpp => &CPP,
    }
}

/// Scans submitted source for forbidden constructs before anything touches disk.
///
/// This is a best-effort denylist. It stops the obvious escapes cheaply, but obfuscated
/// code can get past it, so the real boundary has to come from the execution
/// environment (unprivileged user, no network, cgroup limits).
pub fn check_for_dangerous_code(content: &str, language: Language) -> Result<(), SandboxError> {
    let mut found: Vec<&'static str> = Vec::new();

    for pattern in COMMON.iter().chain(patterns_for(language).iter()) {
        if pattern.regex.is_match(content) && !found.contains(&pattern.description) {
            found.push(pattern.description);
        }
    }

    if found.is_empty() {
        return Ok(());
    }

    warn!(language = %language, "Rejected submission: {}", found.join(", "));
    let mut message = String::from("Potentially dangerous code patterns found:");
    for description in found {
        message.push_str("\n- ");
        message.push_str(description);
    }
    Err(SandboxError::SecurityViolation(message))
}
