//! Payload scrubber.
//!
//! Runs every free-text event field through the built-in and configured
//! patterns before the event is serialized into a batch.

use regex::Regex;
use tracing::trace;

use super::patterns::{builtin_patterns, ScrubPattern};

/// Placeholder written over redacted text.
pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

/// Configuration for the scrubber.
#[derive(Debug, Clone)]
pub struct ScrubConfig {
    /// Whether scrubbing is enabled.
    pub enabled: bool,

    /// Custom regex patterns to redact, in addition to the built-ins.
    pub custom_patterns: Vec<String>,

    /// Placeholder text for redacted content.
    pub placeholder: String,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            custom_patterns: Vec::new(),
            placeholder: REDACTION_PLACEHOLDER.to_string(),
        }
    }
}

/// Redacts sensitive substrings from event text.
#[derive(Debug)]
pub struct Scrubber {
    config: ScrubConfig,
    patterns: Vec<ScrubPattern>,
    custom_regexes: Vec<Regex>,
}

impl Scrubber {
    /// Create a scrubber with the built-in patterns only.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ScrubConfig::default())
    }

    /// Create a scrubber from configuration.
    ///
    /// Invalid custom patterns are skipped with a warning; configuration
    /// validation rejects them earlier on the normal startup path.
    #[must_use]
    pub fn with_config(config: ScrubConfig) -> Self {
        let custom_regexes = config
            .custom_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Invalid custom scrub pattern");
                    None
                }
            })
            .collect();

        Self {
            config,
            patterns: builtin_patterns(),
            custom_regexes,
        }
    }

    /// A scrubber that passes text through untouched.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_config(ScrubConfig {
            enabled: false,
            ..ScrubConfig::default()
        })
    }

    /// Check if scrubbing is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Return `text` with every sensitive match replaced.
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        if !self.config.enabled {
            return text.to_string();
        }

        let mut result = text.to_string();
        for pattern in &self.patterns {
            if pattern.matches(&result) {
                result = pattern.redact(&result, &self.config.placeholder);
                trace!(pattern = %pattern.name, "Text scrubbed by pattern");
            }
        }
        for (i, regex) in self.custom_regexes.iter().enumerate() {
            if regex.is_match(&result) {
                result = regex
                    .replace_all(&result, self.config.placeholder.as_str())
                    .to_string();
                trace!(pattern_index = %i, "Text scrubbed by custom pattern");
            }
        }
        result
    }
}

impl Default for Scrubber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_config_default() {
        let config = ScrubConfig::default();
        assert!(config.enabled);
        assert!(config.custom_patterns.is_empty());
        assert_eq!(config.placeholder, "[REDACTED]");
    }

    #[test]
    fn test_scrub_passes_clean_text() {
        let scrubber = Scrubber::new();
        assert_eq!(scrubber.scrub("/products?page=2"), "/products?page=2");
        assert_eq!(
            scrubber.scrub("TypeError: cannot read x"),
            "TypeError: cannot read x"
        );
    }

    #[test]
    fn test_scrub_redacts_builtin_matches() {
        let scrubber = Scrubber::new();
        let out = scrubber.scrub("login failed for bob@example.com with password=letmein");
        assert!(!out.contains("bob@example.com"));
        assert!(!out.contains("letmein"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_scrub_custom_pattern() {
        let scrubber = Scrubber::with_config(ScrubConfig {
            custom_patterns: vec![r"order-\d+".to_string()],
            ..ScrubConfig::default()
        });
        assert_eq!(scrubber.scrub("/orders/order-991"), "/orders/[REDACTED]");
    }

    #[test]
    fn test_invalid_custom_pattern_is_skipped() {
        let scrubber = Scrubber::with_config(ScrubConfig {
            custom_patterns: vec!["[invalid".to_string()],
            ..ScrubConfig::default()
        });
        assert!(scrubber.custom_regexes.is_empty());
        assert_eq!(scrubber.scrub("plain"), "plain");
    }

    #[test]
    fn test_disabled_scrubber_is_identity() {
        let scrubber = Scrubber::disabled();
        assert!(!scrubber.is_enabled());
        assert_eq!(scrubber.scrub("token=abc"), "token=abc");
    }
}
