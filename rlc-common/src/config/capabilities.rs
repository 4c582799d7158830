//! Engine capability lists.
//!
//! Capabilities are configured as a comma separated list. An entry with a
//! leading `+` is required of every run the engine accepts; a bare entry is
//! merely offered. Blank entries and surrounding whitespace are ignored.

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub required: BTreeSet<String>,
    pub offered: BTreeSet<String>,
}

impl Capabilities {
    pub fn parse(list: &str) -> Self {
        let mut caps = Self::default();
        for entry in list.split(',') {
            let entry = entry.trim();
            match entry.strip_prefix('+') {
                Some(required) => {
                    let required = required.trim();
                    if !required.is_empty() {
                        caps.required.insert(required.to_string());
                    }
                }
                None if !entry.is_empty() => {
                    caps.offered.insert(entry.to_string());
                }
                None => {}
            }
        }
        caps
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.offered.is_empty()
    }

    /// The canonical list form, or `None` when there are no capabilities.
    pub fn report(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let required = self.required.iter().map(|c| format!("+{c}"));
        let offered = self.offered.iter().cloned();
        Some(required.chain(offered).collect::<Vec<_>>().join(","))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.report().as_deref().unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guard;
    use proptest::prelude::*;

    #[test]
    fn test_parse_splits_required_and_offered() {
        let _guard = test_guard!();
        let caps = Capabilities::parse(" +docker, java17 ,, + ,zos ,+ gpu");
        assert_eq!(
            caps.required.iter().cloned().collect::<Vec<_>>(),
            vec!["docker".to_string(), "gpu".to_string()]
        );
        assert_eq!(
            caps.offered.iter().cloned().collect::<Vec<_>>(),
            vec!["java17".to_string(), "zos".to_string()]
        );
    }

    #[test]
    fn test_empty_list_reports_nothing() {
        let _guard = test_guard!();
        let caps = Capabilities::parse(" , ,");
        assert!(caps.is_empty());
        assert_eq!(caps.report(), None);
    }

    #[test]
    fn test_report_puts_required_first() {
        let _guard = test_guard!();
        let caps = Capabilities::parse("b,+a");
        assert_eq!(caps.report().as_deref(), Some("+a,b"));
    }

    proptest! {
        #[test]
        fn prop_report_reparses_to_same_capabilities(
            entries in proptest::collection::vec(("[+]?", "[ ]{0,2}", "[a-z0-9]{0,6}"), 0..8)
        ) {
            let list = entries
                .iter()
                .map(|(plus, pad, name)| format!("{pad}{plus}{name}{pad}"))
                .collect::<Vec<_>>()
                .join(",");
            let caps = Capabilities::parse(&list);
            let reparsed = Capabilities::parse(&caps.report().unwrap_or_default());
            prop_assert_eq!(reparsed, caps);
        }

        #[test]
        fn prop_parsed_entries_are_trimmed_and_non_empty(list in "[ +,a-z]{0,40}") {
            let caps = Capabilities::parse(&list);
            for cap in caps.required.iter().chain(caps.offered.iter()) {
                prop_assert!(!cap.is_empty());
                prop_assert_eq!(cap.trim(), cap.as_str());
                prop_assert!(!cap.contains(','));
            }
        }
    }
}
