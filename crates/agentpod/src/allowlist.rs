//! Allow-list matching for agent key identities.
//!
//! Rules are glob patterns matched case-sensitively against the whole
//! identifier: an SSH key comment, an SSH fingerprint (`SHA256:...`), or a
//! GPG keygrip. An empty list means passthrough (everything matches).

use glob::{MatchOptions, Pattern};

use crate::error::{PodError, PodResult};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled, immutable allow-list.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    rules: Vec<Pattern>,
}

impl AllowList {
    /// Compile allow-list rules. Blank rules are ignored.
    pub fn new<I, S>(rules: I) -> PodResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for rule in rules {
            let rule = rule.as_ref().trim();
            if rule.is_empty() {
                continue;
            }
            let pattern = Pattern::new(rule).map_err(|e| {
                PodError::Config(format!("invalid allow-list rule '{rule}': {e}"))
            })?;
            compiled.push(pattern);
        }
        Ok(Self { rules: compiled })
    }

    /// An allow-list that lets everything through.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// True when no rules are configured.
    pub fn is_passthrough(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check a single identifier.
    pub fn matches(&self, id: &str) -> bool {
        self.is_passthrough() || self.rules.iter().any(|p| p.matches_with(id, MATCH_OPTIONS))
    }

    /// Check whether any of several identifiers for the same key matches.
    pub fn matches_any<'a, I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.is_passthrough() {
            return true;
        }
        ids.into_iter().any(|id| {
            self.rules
                .iter()
                .any(|p| p.matches_with(id, MATCH_OPTIONS))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_matches_everything() {
        let list = AllowList::new(Vec::<String>::new()).unwrap();
        assert!(list.is_passthrough());
        assert!(list.matches("anything"));
        assert!(list.matches(""));
        assert!(list.matches_any(std::iter::empty()));
    }

    #[test]
    fn test_blank_rules_are_ignored() {
        let list = AllowList::new(["", "   "]).unwrap();
        assert!(list.is_passthrough());
    }

    #[test]
    fn test_exact_and_glob_rules() {
        let list = AllowList::new(["work@laptop", "deploy-*"]).unwrap();
        assert!(!list.is_passthrough());
        assert!(list.matches("work@laptop"));
        assert!(list.matches("deploy-github"));
        assert!(!list.matches("personal@laptop"));
        assert!(!list.matches("xdeploy-github"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let list = AllowList::new(["Work@Laptop"]).unwrap();
        assert!(list.matches("Work@Laptop"));
        assert!(!list.matches("work@laptop"));
    }

    #[test]
    fn test_rules_match_whole_identifier() {
        let list = AllowList::new(["laptop"]).unwrap();
        assert!(!list.matches("work@laptop"));
    }

    #[test]
    fn test_slashes_in_identifiers() {
        let list = AllowList::new(["SHA256:*"]).unwrap();
        assert!(list.matches("SHA256:ab/cd+ef"));
    }

    #[test]
    fn test_matches_any() {
        let list = AllowList::new(["SHA256:abc"]).unwrap();
        assert!(list.matches_any(["some comment", "SHA256:abc"]));
        assert!(!list.matches_any(["some comment", "SHA256:xyz"]));
    }

    #[test]
    fn test_invalid_rule_is_config_error() {
        let err = AllowList::new(["[unclosed"]).unwrap_err();
        assert!(matches!(err, PodError::Config(_)));
    }
}
