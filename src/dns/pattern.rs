//! Forward-domain patterns
//!
//! A pattern is one of four glob forms tested against the lowercased,
//! trailing-dot-stripped hostname of a DNS query:
//!
//! - `*` matches every hostname
//! - `*.suffix` matches names with exactly one label in front of `suffix`
//! - `**.suffix` matches any name ending in `.suffix`, regardless of depth
//! - anything else matches only its exact FQDN
//!
//! Patterns are evaluated in configuration order; the first match wins.

use crate::error::ConfigError;

/// One parsed forward-domain glob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPattern {
    /// `*`
    Any,
    /// `*.suffix`: exactly one extra label
    Suffix(String),
    /// `**.suffix`: any depth
    RecursiveSuffix(String),
    /// Literal FQDN
    Exact(String),
}

impl ForwardPattern {
    /// Parse a pattern string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for empty patterns, embedded
    /// whitespace, or a bare/malformed wildcard.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let pattern = raw.trim();
        if pattern.is_empty() {
            return Err(ConfigError::validation("empty forward-domain pattern"));
        }
        if pattern.chars().any(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "forward-domain pattern {pattern:?} contains whitespace"
            )));
        }

        if pattern == "*" {
            return Ok(Self::Any);
        }

        if let Some(suffix) = pattern.strip_prefix("**.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(ConfigError::validation(format!(
                    "invalid forward-domain pattern {pattern:?}"
                )));
            }
            return Ok(Self::RecursiveSuffix(suffix.to_ascii_lowercase()));
        }

        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(ConfigError::validation(format!(
                    "invalid forward-domain pattern {pattern:?}"
                )));
            }
            return Ok(Self::Suffix(suffix.to_ascii_lowercase()));
        }

        if pattern.contains('*') {
            return Err(ConfigError::validation(format!(
                "invalid forward-domain pattern {pattern:?}: wildcards are only valid as a leading label"
            )));
        }

        Ok(Self::Exact(
            pattern.trim_end_matches('.').to_ascii_lowercase(),
        ))
    }

    /// Test a normalized hostname against this pattern
    #[must_use]
    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Suffix(suffix) => {
                let Some(rest) = hostname.strip_suffix(suffix.as_str()) else {
                    return false;
                };
                let Some(label) = rest.strip_suffix('.') else {
                    return false;
                };
                !label.is_empty() && !label.contains('.')
            }
            Self::RecursiveSuffix(suffix) => hostname
                .strip_suffix(suffix.as_str())
                .and_then(|rest| rest.strip_suffix('.'))
                .is_some_and(|rest| !rest.is_empty()),
            Self::Exact(fqdn) => hostname == fqdn,
        }
    }
}

/// Ordered list of patterns, first match wins
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<ForwardPattern>,
}

impl PatternSet {
    /// Parse an ordered list of pattern strings.
    ///
    /// # Errors
    ///
    /// Returns the first pattern's parse error.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, ConfigError> {
        let patterns = raw
            .iter()
            .map(|s| ForwardPattern::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Index and pattern of the first match, if any
    #[must_use]
    pub fn first_match(&self, hostname: &str) -> Option<(usize, &ForwardPattern)> {
        self.patterns
            .iter()
            .enumerate()
            .find(|(_, p)| p.matches(hostname))
    }

    /// Whether any pattern matches the hostname
    #[must_use]
    pub fn matches(&self, hostname: &str) -> bool {
        self.first_match(hostname).is_some()
    }

    /// Number of patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Normalize a query name: trim whitespace, strip one trailing dot, lowercase
#[must_use]
pub fn normalize_hostname(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}
