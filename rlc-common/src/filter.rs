//! Glob-based selection of reconcilers by name.
//!
//! Patterns support `*` (any run of characters) and `?` (one character);
//! every other character matches literally. A name is selected when it
//! matches an include pattern and no exclude pattern.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid reconciler pattern '{pattern}': {source}")]
pub struct PatternError {
    pattern: String,
    #[source]
    source: regex::Error,
}

#[derive(Debug, Clone)]
pub struct ReconcilerFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl ReconcilerFilter {
    pub fn new<S: AsRef<str>>(includes: &[S], excludes: &[S]) -> Result<Self, PatternError> {
        Ok(Self {
            includes: compile_all(includes)?,
            excludes: compile_all(excludes)?,
        })
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.includes.iter().any(|re| re.is_match(name))
            && !self.excludes.iter().any(|re| re.is_match(name))
    }
}

fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, PatternError> {
    patterns
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(&glob_to_regex(p)).map_err(|source| PatternError {
                pattern: p.to_string(),
                source,
            })
        })
        .collect()
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guard;

    #[test]
    fn test_default_include_selects_everything() {
        let _guard = test_guard!();
        let filter = ReconcilerFilter::new(&["*"], &[]).unwrap();
        assert!(filter.is_selected("orphan-pod-reaper"));
        assert!(filter.is_selected("finished-run-retention"));
    }

    #[test]
    fn test_excludes_win_over_includes() {
        let _guard = test_guard!();
        let filter = ReconcilerFilter::new(&["*-timeout", "orphan-*"], &["local-*"]).unwrap();
        assert!(filter.is_selected("allocated-run-timeout"));
        assert!(filter.is_selected("orphan-pod-reaper"));
        assert!(!filter.is_selected("local-queued-run-timeout"));
        assert!(!filter.is_selected("interrupt-event-processor"));
    }

    #[test]
    fn test_dot_and_question_mark() {
        let _guard = test_guard!();
        let filter = ReconcilerFilter::new(&["v?.x"], &[]).unwrap();
        assert!(filter.is_selected("v1.x"));
        assert!(!filter.is_selected("v1yx"));
        assert!(!filter.is_selected("v12.x"));
    }

    #[test]
    fn test_empty_includes_select_nothing() {
        let _guard = test_guard!();
        let filter = ReconcilerFilter::new::<&str>(&[" "], &[]).unwrap();
        assert!(!filter.is_selected("anything"));
    }
}
