//! Controller Selector
//!
//! Parses the `--controllers` enable-list.

use serde::Serialize;

/// Ordered, de-duplicated controller names from `--controllers`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnableList {
    names: Vec<String>,
}

impl EnableList {
    /// Parse a comma-separated list.
    ///
    /// Elements are trimmed and compared case-sensitively. Empty elements are
    /// dropped and only the first occurrence of a repeated name is kept.
    pub fn parse(value: &str) -> Self {
        let mut names: Vec<String> = Vec::new();
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Self { names }
    }

    /// Names in the order they were requested
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl std::fmt::Display for EnableList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preserves_request_order() {
        let list = EnableList::parse("resizer, attacher");
        assert_eq!(list.names(), ["resizer", "attacher"]);
        assert_eq!(list.to_string(), "resizer,attacher");
    }

    #[test]
    fn test_parse_empty() {
        assert!(EnableList::parse("").is_empty());
        assert!(EnableList::parse("  ").is_empty());
        assert!(EnableList::parse(",,").is_empty());
    }

    #[test]
    fn test_parse_drops_duplicates_and_blanks() {
        let list = EnableList::parse("attacher,,attacher , provisioner,");
        assert_eq!(list.names(), ["attacher", "provisioner"]);
        assert_eq!(list.len(), 2);
        assert!(list.contains("provisioner"));
        assert!(!list.contains("resizer"));
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        let list = EnableList::parse("Attacher");
        assert!(!list.contains("attacher"));
    }
}
