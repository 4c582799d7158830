//! Label selectors for listing orchestrator pods.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    Exists(String),
}

/// A conjunction of label requirements, rendered in the orchestrator's
/// `key=value,key` selector syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(key, value) => labels.get(key) == Some(value),
            Requirement::Exists(key) => labels.contains_key(key),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, req) in self.requirements.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            match req {
                Requirement::Equals(key, value) => write!(f, "{key}={value}")?,
                Requirement::Exists(key) => f.write_str(key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guard;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let _guard = test_guard!();
        assert!(LabelSelector::new().matches(&labels(&[])));
    }

    #[test]
    fn test_selector_requires_every_term() {
        let _guard = test_guard!();
        let selector = LabelSelector::new()
            .equals("engine", "k8s-standard")
            .exists("run");

        assert!(selector.matches(&labels(&[("engine", "k8s-standard"), ("run", "U1")])));
        assert!(!selector.matches(&labels(&[("engine", "k8s-standard")])));
        assert!(!selector.matches(&labels(&[("engine", "other"), ("run", "U1")])));
    }

    #[test]
    fn test_selector_renders_orchestrator_syntax() {
        let _guard = test_guard!();
        let selector = LabelSelector::new().equals("engine", "std").exists("run");
        assert_eq!(selector.to_string(), "engine=std,run");
    }
}
