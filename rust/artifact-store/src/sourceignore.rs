//! Exclusion patterns for archived source trees, in the `.sourceignore`
//! format (the `.gitignore` subset used by source archives): one pattern
//! per line, `#` comments, `!` negations, `*`/`**`/`?` wildcards, leading
//! `/` anchoring and trailing `/` directory-only matches. The last
//! matching pattern wins.

use regex::Regex;
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid pattern {:?}: {}", pattern, source))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

struct Pattern {
    matcher: Regex,
    negated: bool,
    directory_only: bool,
}

pub struct IgnoreFilter {
    patterns: Vec<Pattern>,
}

impl IgnoreFilter {
    pub fn new(patterns: &str) -> Result<Self, Error> {
        let mut compiled = Vec::new();
        for line in patterns.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, line) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (directory_only, line) = match line.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let matcher = compile(line).context(InvalidPatternSnafu { pattern: line })?;
            compiled.push(Pattern {
                matcher,
                negated,
                directory_only,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// Whether a path relative to the archive root is excluded.
    pub fn is_ignored(&self, path: &std::path::Path, is_dir: bool) -> bool {
        let path = path.to_string_lossy().replace('\\', "/");
        let mut ignored = false;
        for pattern in &self.patterns {
            if pattern.directory_only && !is_dir {
                continue;
            }
            if pattern.matcher.is_match(&path) {
                ignored = !pattern.negated;
            }
        }
        ignored
    }
}

/// Translates one ignore pattern into an anchored regex. Unanchored
/// patterns match at any depth, like gitignore.
fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let (anchored, pattern) = match pattern.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (pattern.contains('/'), pattern),
    };

    let mut regex = String::from("^");
    if !anchored {
        regex.push_str("(?:.*/)?");
    }

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` spans directories, including none.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    // A pattern matches the path itself and everything below it.
    regex.push_str("(?:/.*)?$");
    Regex::new(&regex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ignored(patterns: &str, path: &str) -> bool {
        IgnoreFilter::new(patterns)
            .unwrap()
            .is_ignored(Path::new(path), false)
    }

    #[test]
    fn plain_name_matches_at_any_depth() {
        assert!(ignored("README.md", "README.md"));
        assert!(ignored("README.md", "docs/README.md"));
        assert!(!ignored("README.md", "README.txt"));
    }

    #[test]
    fn star_does_not_cross_separators() {
        assert!(ignored("*.md", "README.md"));
        assert!(ignored("*.md", "docs/guide.md"));
        assert!(!ignored("docs/*.md", "docs/sub/guide.md"));
    }

    #[test]
    fn double_star_crosses_separators() {
        assert!(ignored("docs/**", "docs/sub/guide.md"));
        assert!(ignored("**/guide.md", "docs/sub/guide.md"));
        assert!(ignored("**/guide.md", "guide.md"));
    }

    #[test]
    fn anchored_pattern_only_matches_root() {
        assert!(ignored("/vendor", "vendor"));
        assert!(ignored("/vendor", "vendor/module/file.go"));
        assert!(!ignored("/vendor", "third_party/vendor"));
    }

    #[test]
    fn negation_rescinds_earlier_match() {
        let patterns = "*.md\n!docs/keep.md\n";
        assert!(ignored(patterns, "README.md"));
        assert!(!ignored(patterns, "docs/keep.md"));
    }

    #[test]
    fn directory_only_pattern_skips_files() {
        let filter = IgnoreFilter::new(".git/\n").unwrap();
        assert!(filter.is_ignored(Path::new(".git"), true));
        assert!(!filter.is_ignored(Path::new(".git"), false));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let patterns = "# exclude markdown\n\n*.md\n";
        assert!(ignored(patterns, "README.md"));
        assert!(!ignored(patterns, "main.rs"));
    }
}
