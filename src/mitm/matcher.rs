//! Interception host selection

/// Decides which CONNECT hosts go through interception.
///
/// Patterns are exact hosts or `*.domain`, which matches `domain` and any of its
/// subdomains. No patterns means every host matches.
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    patterns: Vec<String>,
}

impl HostMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns
            .iter()
            .any(|pattern| matches_wildcard(pattern, &host))
    }
}

/// Check if pattern matches host (wildcard support)
fn matches_wildcard(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(domain) => {
            host == domain
                || (host.len() > domain.len()
                    && host.ends_with(domain)
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        }
        None => pattern == host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matcher_matches_everything() {
        let matcher = HostMatcher::default();
        assert!(matcher.matches("anything.test"));
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        let matcher = HostMatcher::new(["Api.Example.com"]);
        assert!(matcher.matches("api.example.com"));
        assert!(matcher.matches("API.EXAMPLE.COM."));
        assert!(!matcher.matches("www.example.com"));
    }

    #[test]
    fn test_wildcard_matches_domain_and_subdomains() {
        let matcher = HostMatcher::new(["*.example.com"]);
        assert!(matcher.matches("example.com"));
        assert!(matcher.matches("a.example.com"));
        assert!(matcher.matches("a.b.example.com"));
        assert!(!matcher.matches("badexample.com"));
        assert!(!matcher.matches("example.org"));
    }
}
