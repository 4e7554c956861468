//! Wildcard domain patterns shared by the relay admission check and the
//! DNS front-end.
//!
//! Patterns use simple glob semantics: `*` matches any run of characters
//! (including the empty run and dots), `?` matches exactly one character.
//! Matching is case-sensitive and is NOT anchored to label boundaries:
//! `*.example` matches `a.b.example`, and `*example` matches
//! `badexample`. This is part of the configuration surface and is kept
//! deliberately loose; operators who want label-exact rules should write
//! them without metacharacters.

use wildmatch::WildMatch;

/// An ordered set of wildcard domain patterns. First match wins; an empty
/// set matches nothing.
#[derive(Debug, Clone, Default)]
pub struct DomainPatterns {
    patterns: Vec<WildMatch>,
}

impl DomainPatterns {
    /// Compiles the given patterns. Order is preserved.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| WildMatch::new(p.as_ref()))
                .collect(),
        }
    }

    /// Checks whether the hostname matches any pattern. A single trailing
    /// dot (FQDN form) is stripped before matching.
    pub fn matches(&self, hostname: &str) -> bool {
        let hostname = hostname.strip_suffix('.').unwrap_or(hostname);

        self.patterns.iter().any(|p| p.matches(hostname))
    }

    /// Returns true when no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
