use std::sync::LazyLock;

use regex::Regex;

static STAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^grep\s+(?:(-v)\s+)?(.+)$").unwrap());

/// One compiled stage of a grep-style pattern pipeline
#[derive(Clone, Debug)]
pub struct FilterStage {
    pub pattern: Regex,
    pub exclude: bool,
}

/// Parse a pipe-separated filter expression into ordered stages.
///
/// Each stage matches `grep [-v] <quoted-or-bare-pattern>`. Unrecognized
/// stages are dropped rather than rejected, and a pattern that is not a
/// valid regex is compiled as a literal string.
pub fn parse(expression: &str) -> Vec<FilterStage> {
    expression
        .split('|')
        .filter_map(|stage| {
            let stage = stage.trim();
            if stage.is_empty() {
                return None;
            }

            let Some(caps) = STAGE.captures(stage) else {
                tracing::debug!(stage, "dropping unrecognized filter stage");
                return None;
            };

            let exclude = caps.get(1).is_some();
            let pattern = strip_quotes(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
            if pattern.is_empty() {
                tracing::debug!(stage, "dropping filter stage with empty pattern");
                return None;
            }

            let compiled = Regex::new(pattern).unwrap_or_else(|_| {
                // Invalid regex: treat the pattern as a literal string
                Regex::new(&regex::escape(pattern)).expect("escaped pattern always compiles")
            });

            Some(FilterStage {
                pattern: compiled,
                exclude,
            })
        })
        .collect()
}

/// Check a line against every stage in order, AND semantics.
///
/// A normal stage passes when its pattern matches, an exclude stage when it
/// does not; the first failing stage short-circuits. An empty stage list is
/// universally permissive.
pub fn apply(line: &str, stages: &[FilterStage]) -> bool {
    stages
        .iter()
        .all(|stage| stage.pattern.is_match(line) != stage.exclude)
}

fn strip_quotes(pattern: &str) -> &str {
    let pattern = pattern.trim();
    for quote in ['"', '\''] {
        if pattern.len() >= 2 && pattern.starts_with(quote) && pattern.ends_with(quote) {
            return &pattern[1..pattern.len() - 1];
        }
    }
    pattern
}
