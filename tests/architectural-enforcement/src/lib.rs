//! Architectural Enforcement
//!
//! Source scanners shared by the enforcement tests in `tests/`:
//! - No sleep() outside reconnect backoff and shutdown grace
//! - No unwrap()/expect() in production code
//!
//! Scanning is line based. Comments and everything after the first
//! `#[cfg(test)]` in a file are ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_ROOTS: &[&str] = &["livesync/core/src"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The trimmed source line
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every `.rs` file under the production roots
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_ROOTS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

/// Lines of a file that belong to production code, with their 1-based numbers
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx + 1, code_part(line)))
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// The part of a line before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Run `check` over every production line of every production file
pub fn scan(check: impl Fn(&[(usize, &str)], usize) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_files() {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        let lines = production_lines(&content);
        for idx in 0..lines.len() {
            if check(&lines, idx) {
                let (line, text) = lines[idx];
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Whether the line calls a sleep function
#[must_use]
pub fn is_sleep_call(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(")
}

/// Whether a sleep sits in reconnect backoff or shutdown grace
///
/// Looks for backoff, reconnect or grace wording within a few lines.
#[must_use]
pub fn is_backoff_context(lines: &[(usize, &str)], idx: usize) -> bool {
    let range = idx.saturating_sub(15)..std::cmp::min(idx + 5, lines.len());
    lines[range].iter().any(|(_, line)| {
        let line = line.to_lowercase();
        line.contains("backoff") || line.contains("reconnect") || line.contains("grace")
    })
}

/// Whether the line unwraps a Result or Option
#[must_use]
pub fn is_panicking_unwrap(code: &str) -> bool {
    code.contains(".unwrap()") || code.contains(".expect(")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_modules_are_skipped() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines = production_lines(content);
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_comments_are_skipped() {
        let lines = production_lines("/// let x = y.unwrap();\nlet z = 1; // sleep(1)\n");
        assert_eq!(lines.len(), 1);
        assert!(!is_panicking_unwrap(lines[0].1));
        assert!(!is_sleep_call(lines[0].1));
    }

    #[test]
    fn test_backoff_detection() {
        let content = [
            "async fn wait_reconnect(&mut self) -> bool {",
            "    let delay = self.backoff.next_delay();",
            "    let backoff_delay = tokio::time::sleep(delay);",
            "}",
        ]
        .join("\n");
        let lines = production_lines(&content);
        assert!(is_sleep_call(lines[2].1));
        assert!(is_backoff_context(&lines, 2));
    }

    #[test]
    fn test_bare_sleep_is_flagged() {
        let content = [
            "async fn poll_forever() {",
            "    loop {",
            "        tokio::time::sleep(Duration::from_millis(10)).await;",
            "    }",
            "}",
        ]
        .join("\n");
        let lines = production_lines(&content);
        assert!(is_sleep_call(lines[2].1));
        assert!(!is_backoff_context(&lines, 2));
    }
}
