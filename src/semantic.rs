use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::runtime::Language;

pub const MAX_STRUCTURE_SCORE: u32 = 5;
pub const MAX_KEYWORD_SCORE: u32 = 10;
pub const MAX_COMPLEXITY_SCORE: f64 = 10.0;
pub const MAX_SIMILARITY_SCORE: f64 = 5.0;

const STRUCTURE_THRESHOLD: u32 = 2;
const KEYWORD_THRESHOLD: u32 = 3;
const COMPLEXITY_THRESHOLD: f64 = 2.0;
const SIMILARITY_THRESHOLD: f64 = 2.0;

/// Heuristic read of a submission, computed without running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticAnalysis {
    pub syntax_valid: bool,
    /// 0..=5
    pub structure_score: u32,
    /// 0..=10
    pub keyword_score: u32,
    /// 0..=10
    pub complexity_score: f64,
    /// 0..=5, zero when no reference was supplied
    pub similarity_score: f64,
    pub suggestions: Vec<String>,
}

impl SemanticAnalysis {
    /// All-zero analysis carrying a single explanation.
    pub fn empty(reason: impl Into<String>) -> Self {
        Self {
            syntax_valid: false,
            structure_score: 0,
            keyword_score: 0,
            complexity_score: 0.0,
            similarity_score: 0.0,
            suggestions: vec![reason.into()],
        }
    }
}

/// Raw construct counts for one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeFeatures {
    pub nonblank_lines: usize,
    pub functions: usize,
    pub conditionals: usize,
    pub loops: usize,
    pub returns: usize,
    pub collections: usize,
    pub error_handling: usize,
}

struct LanguageRules {
    functions: Regex,
    conditionals: Regex,
    loops: Regex,
    returns: Regex,
    collections: Regex,
    error_handling: Regex,
    keywords: Vec<Regex>,
}

fn compile(pattern: &str) -> Regex {
    // Patterns are literals in this file; an invalid one is a bug caught by the tests.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid analyzer pattern {}: {}", pattern, e))
}

fn keyword_set(words: &[&str]) -> Vec<Regex> {
    words
        .iter()
        .map(|word| compile(&format!(r"\b{}\b", regex::escape(word))))
        .collect()
}

// Method definitions in C-family languages: a return type, a name, a parameter list, a body.
const C_FAMILY_FUNCTION: &str =
    r"\b([A-Za-z_][\w:<>,\[\]]*)[\s*&]+([A-Za-z_]\w*)\s*\([^;{}()]*\)\s*(?:const\s*)?(?:throws\s+[\w.,\s]+)?\{";
const C_FAMILY_NOT_FUNCTIONS: &[&str] = &["if", "while", "for", "switch", "catch", "return", "else", "new", "do"];

lazy_static! {
    static ref PYTHON: LanguageRules = LanguageRules {
        functions: compile(r"\bdef\s+\w+\s*\(|\blambda\b"),
        conditionals: compile(r"\b(if|elif)\b"),
        loops: compile(r"\b(for|while)\b"),
        returns: compile(r"\breturn\b"),
        collections: compile(r"\[|\{|\b(list|dict|set|tuple)\s*\("),
        error_handling: compile(r"\btry\s*:|\bexcept\b|\braise\b"),
        keywords: keyword_set(&["def", "return", "if", "elif", "else", "for", "while", "in", "class", "try"]),
    };
    static ref JAVASCRIPT: LanguageRules = LanguageRules {
        functions: compile(r"\bfunction\b|=>"),
        conditionals: compile(r"\b(if|switch)\s*\("),
        loops: compile(r"\b(for|while)\s*\(|\bdo\s*\{"),
        returns: compile(r"\breturn\b"),
        collections: compile(r"\[|\bnew\s+(Map|Set|Array)\b|\{\s*\w+\s*:"),
        error_handling: compile(r"\btry\s*\{|\bcatch\b|\bthrow\b"),
        keywords: keyword_set(&["function", "return", "if", "else", "for", "while", "const", "let", "class", "try"]),
    };
    static ref JAVA: LanguageRules = LanguageRules {
        functions: compile(C_FAMILY_FUNCTION),
        conditionals: compile(r"\b(if|switch)\s*\("),
        loops: compile(r"\b(for|while)\s*\(|\bdo\s*\{"),
        returns: compile(r"\breturn\b"),
        collections: compile(r"\[\]|\b(List|ArrayList|Map|HashMap|Set|HashSet|Deque|ArrayDeque)\b"),
        error_handling: compile(r"\btry\s*\{|\bcatch\s*\(|\bthrows?\b"),
        keywords: keyword_set(&["public", "static", "void", "class", "return", "if", "else", "for", "while", "new"]),
    };
    static ref CPP: LanguageRules = LanguageRules {
        functions: compile(C_FAMILY_FUNCTION),
        conditionals: compile(r"\b(if|switch)\s*\("),
        loops: compile(r"\b(for|while)\s*\(|\bdo\s*\{"),
        returns: compile(r"\breturn\b"),
        collections: compile(r"\w\s*\[\s*\w*\s*\]|\b(vector|map|set|unordered_map|unordered_set|array|deque)\s*<"),
        error_handling: compile(r"\btry\s*\{|\bcatch\s*\(|\bthrow\b"),
        keywords: keyword_set(&["include", "int", "return", "if", "else", "for", "while", "std", "const", "auto"]),
    };
    static ref ENTRY_POINT: Regex = compile(r"\bmain\s*\(");
    static ref PYTHON_BLOCK_HEADER: Regex =
        compile(r"^(def|class|if|elif|else|for|while|try|except|finally|with)\b");
    static ref WORD: Regex = compile(r"[A-Za-z0-9_]+");
}

fn rules_for(language: Language) -> &'static LanguageRules {
    match language {
        Language::Python => &PYTHON,
        Language::JavaScript => &JAVASCRIPT,
        Language::Java => &JAVA,
        Language::Cpp => &CPP,
    }
}

/// Scores a submission on structure, vocabulary, size, and (given a reference) similarity.
pub fn analyze_code(code: &str, language: Language, reference: Option<&str>) -> SemanticAnalysis {
    let features = extract_features(code, language);
    let syntax_valid = check_syntax(code, language);
    let structure_score = structure_score(&features);
    let keyword_score = keyword_score(code, language);
    let complexity_score = complexity_score(&features);
    let similarity_score = reference
        .map(|reference| token_similarity(code, reference) * MAX_SIMILARITY_SCORE)
        .unwrap_or(0.0);

    let mut suggestions = Vec::new();
    if !syntax_valid {
        suggestions.push("Check the syntax: brackets, quotes, or the program entry point look incomplete".to_string());
    }
    if structure_score < STRUCTURE_THRESHOLD {
        suggestions.push("Organize the solution with functions, conditionals, and loops".to_string());
    }
    if keyword_score < KEYWORD_THRESHOLD {
        suggestions.push(format!("Make more use of {} language constructs", language));
    }
    if complexity_score < COMPLEXITY_THRESHOLD {
        suggestions.push("The solution looks too small to handle the whole problem".to_string());
    }
    if reference.is_some() && similarity_score < SIMILARITY_THRESHOLD {
        suggestions.push("The approach differs a lot from the expected solution".to_string());
    }

    SemanticAnalysis {
        syntax_valid,
        structure_score,
        keyword_score,
        complexity_score,
        similarity_score,
        suggestions,
    }
}

pub fn extract_features(code: &str, language: Language) -> CodeFeatures {
    let rules = rules_for(language);
    let functions = match language {
        Language::Java | Language::Cpp => rules
            .functions
            .captures_iter(code)
            .filter(|caps| {
                let declared_type = caps.get(1).map_or("", |m| m.as_str());
                let name = caps.get(2).map_or("", |m| m.as_str());
                !C_FAMILY_NOT_FUNCTIONS.contains(&declared_type)
                    && !C_FAMILY_NOT_FUNCTIONS.contains(&name)
            })
            .count(),
        _ => rules.functions.find_iter(code).count(),
    };

    CodeFeatures {
        nonblank_lines: code.lines().filter(|line| !line.trim().is_empty()).count(),
        functions,
        conditionals: rules.conditionals.find_iter(code).count(),
        loops: rules.loops.find_iter(code).count(),
        returns: rules.returns.find_iter(code).count(),
        collections: rules.collections.find_iter(code).count(),
        error_handling: rules.error_handling.find_iter(code).count(),
    }
}

fn structure_score(features: &CodeFeatures) -> u32 {
    let present = [
        features.functions,
        features.conditionals,
        features.loops,
        features.returns,
        features.collections,
    ]
    .iter()
    .filter(|count| **count > 0)
    .count() as u32;
    present.min(MAX_STRUCTURE_SCORE)
}

fn keyword_score(code: &str, language: Language) -> u32 {
    let used = rules_for(language)
        .keywords
        .iter()
        .filter(|keyword| keyword.is_match(code))
        .count() as u32;
    used.min(MAX_KEYWORD_SCORE)
}

fn complexity_score(features: &CodeFeatures) -> f64 {
    let raw = features.nonblank_lines as f64 / 10.0
        + (features.functions + features.loops + features.conditionals) as f64;
    raw.min(MAX_COMPLEXITY_SCORE)
}

/// Lower-cased words longer than three characters.
pub fn tokenize(code: &str) -> HashSet<String> {
    WORD.find_iter(code)
        .map(|m| m.as_str().to_lowercase())
        .filter(|word| word.chars().count() > 3)
        .collect()
}

/// Jaccard index of the two token sets, in 0..=1.
///
/// Two snippets with no qualifying tokens count as identical; exactly one empty side
/// counts as nothing in common.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let left = tokenize(a);
    let right = tokenize(b);
    match (left.is_empty(), right.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

/// Best-effort plausibility check; never parses the language properly.
pub fn check_syntax(code: &str, language: Language) -> bool {
    if code.trim().is_empty() || !brackets_balanced(code, language) {
        return false;
    }
    match language {
        Language::Java | Language::Cpp => ENTRY_POINT.is_match(code),
        Language::Python => python_blocks_well_formed(code),
        Language::JavaScript => true,
    }
}

/// Bracket balance, skipping string literals and comments.
fn brackets_balanced(code: &str, language: Language) -> bool {
    let chars: Vec<char> = code.chars().collect();
    let mut stack = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '#' if language == Language::Python => i = skip_line(&chars, i),
            '/' if language != Language::Python && next == Some('/') => i = skip_line(&chars, i),
            '/' if language != Language::Python && next == Some('*') => {
                match find_from(&chars, i + 2, &['*', '/']) {
                    Some(end) => i = end,
                    None => return false,
                }
            }
            '"' | '\'' | '`' => {
                let triple = language == Language::Python
                    && next == Some(c)
                    && chars.get(i + 2) == Some(&c);
                let end = if triple {
                    find_from(&chars, i + 3, &[c, c, c])
                } else {
                    closing_quote(&chars, i + 1, c)
                };
                match end {
                    Some(end) => i = end,
                    None => return false,
                }
            }
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
        i += 1;
    }
    stack.is_empty()
}

fn skip_line(chars: &[char], from: usize) -> usize {
    chars[from..]
        .iter()
        .position(|c| *c == '\n')
        .map_or(chars.len(), |offset| from + offset)
}

/// Index of the last character of `needle` starting at or after `from`.
fn find_from(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset + needle.len() - 1)
}

fn closing_quote(chars: &[char], from: usize, quote: char) -> Option<usize> {
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            c if c == quote => return Some(i),
            '\n' if quote != '`' => return None,
            _ => {}
        }
        i += 1;
    }
    None
}

/// The part of a Python line before a `#` that is not inside a string literal.
fn python_code_part(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (index, c) in line.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '#' => return &line[..index],
            None => {}
        }
    }
    line
}

fn python_blocks_well_formed(code: &str) -> bool {
    code.lines().all(|line| {
        let stripped = python_code_part(line).trim_end();
        let trimmed = stripped.trim_start();
        if !PYTHON_BLOCK_HEADER.is_match(trimmed) {
            return true;
        }
        // Headers that continue on the next line are judged there.
        if stripped.ends_with(&['(', '[', '{', ',', '\\'][..]) {
            return true;
        }
        stripped.ends_with(':') || trimmed.contains(": ")
    })
}
