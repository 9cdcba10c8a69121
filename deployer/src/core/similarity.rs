//! Text similarity and normalization used by loop detection.
//!
//! Ratios follow the classic sequence-matcher definition (`2 * matches / total
//! length`), computed with a character-level diff.

use std::sync::LazyLock;

use regex::Regex;
use similar::TextDiff;

/// Outputs longer than this are sampled head + tail before comparison.
const SAMPLE_THRESHOLD: usize = 2000;
const SAMPLE_HALF: usize = 1000;

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T\s]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("timestamp regex")
});
static PID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(pid|process)[:=\s]+\d+").expect("pid regex"));
static TEMP_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/tmp/[\w.\-]+").expect("temp path regex"));
static WIN_TEMP_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\\temp\\[\w.\-]+").expect("windows temp regex"));

static SIGNATURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)Error:\s*.{0,80}",
        r"(?i)Exception:\s*.{0,80}",
        r"(?i)EACCES|ENOENT|EPERM|EADDRINUSE|ECONNREFUSED",
        r"(?i)permission denied",
        r"(?i)command not found",
        r"(?i)cannot find module",
        r"(?i)port.*already in use",
        r"(?i)failed to|unable to|could not",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("signature regex"))
    .collect()
});

/// Similarity ratio in `[0, 1]`; two empty strings are identical.
pub fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    f64::from(TextDiff::from_chars(a, b).ratio())
}

/// Similarity of two shell commands, ignoring case and whitespace layout.
pub fn command_similarity(a: &str, b: &str) -> f64 {
    ratio(&collapse_whitespace(a).to_lowercase(), &collapse_whitespace(b).to_lowercase())
}

/// Similarity of two command outputs after volatile tokens are normalized away.
pub fn output_similarity(a: &str, b: &str) -> f64 {
    ratio(&sample(&normalize_output(a)), &sample(&normalize_output(b)))
}

/// Replace timestamps, PIDs and temp paths with placeholders, collapse
/// whitespace and lowercase.
pub fn normalize_output(output: &str) -> String {
    let text = TIMESTAMP_RE.replace_all(output, "[TS]");
    let text = PID_RE.replace_all(&text, "${1}:[N]");
    let text = TEMP_PATH_RE.replace_all(&text, "/tmp/[TEMP]");
    let text = WIN_TEMP_PATH_RE.replace_all(&text, r"\temp\[TEMP]");
    collapse_whitespace(&text).to_lowercase()
}

/// Short, comparable excerpt of a failure reason.
///
/// The first matching well-known error pattern wins; otherwise the first 100
/// characters of the text.
pub fn error_signature(stderr: &str) -> String {
    for pattern in SIGNATURE_PATTERNS.iter() {
        if let Some(found) = pattern.find(stderr) {
            return found.as_str().trim().to_string();
        }
    }
    stderr.chars().take(100).collect::<String>().trim().to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sample(text: &str) -> String {
    let count = text.chars().count();
    if count <= SAMPLE_THRESHOLD {
        return text.to_string();
    }
    let head: String = text.chars().take(SAMPLE_HALF).collect();
    let tail: String = text.chars().skip(count - SAMPLE_HALF).collect();
    head + &tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_and_empty_strings_are_fully_similar() {
        assert!((ratio("abc", "abc") - 1.0).abs() < f64::EPSILON);
        assert!((ratio("", "") - 1.0).abs() < f64::EPSILON);
        assert!(ratio("abc", "").abs() < f64::EPSILON);
    }

    #[test]
    fn command_similarity_ignores_case_and_spacing() {
        let sim = command_similarity("npm   install", "NPM install");
        assert!((sim - 1.0).abs() < f64::EPSILON, "got {sim}");
    }

    #[test]
    fn normalization_masks_volatile_tokens() {
        let a = "2024-01-02 10:11:12 started pid: 4411 in /tmp/build-abc";
        let b = "2025-06-30T23:59:01.123Z started PID 98 in /tmp/build-xyz";
        assert_eq!(normalize_output(a), normalize_output(b));
        assert_eq!(
            normalize_output(a),
            "[ts] started pid:[n] in /tmp/[temp]"
        );
    }

    #[test]
    fn long_outputs_are_sampled_head_and_tail() {
        let text = format!("{}{}{}", "a".repeat(1500), "b".repeat(1500), "c".repeat(1500));
        let sampled = sample(&text);
        assert_eq!(sampled.len(), 2000);
        assert!(sampled.starts_with('a'));
        assert!(sampled.ends_with('c'));
    }

    #[test]
    fn error_signature_prefers_known_patterns() {
        assert_eq!(
            error_signature("npm ERR! code EADDRINUSE on 3000"),
            "EADDRINUSE"
        );
        assert_eq!(
            error_signature("bash: pm2: command not found"),
            "command not found"
        );
        assert_eq!(
            error_signature("Error: listen failed\nmore"),
            "Error: listen failed"
        );
    }

    #[test]
    fn error_signature_falls_back_to_prefix() {
        let text = "x".repeat(300);
        assert_eq!(error_signature(&text).len(), 100);
    }
}
