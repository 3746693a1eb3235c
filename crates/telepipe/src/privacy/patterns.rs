//! Built-in scrub patterns.
//!
//! These match secrets and personal data that commonly leak into browser
//! error messages, stack traces and URL query strings.

use regex::Regex;

/// A compiled scrub pattern.
#[derive(Debug)]
pub struct ScrubPattern {
    /// Name of the pattern for identification.
    pub name: &'static str,

    /// Description of what this pattern matches.
    pub description: &'static str,

    regex: Regex,
}

impl ScrubPattern {
    /// Create a new scrub pattern.
    ///
    /// # Panics
    ///
    /// Panics if the regex pattern is invalid.
    #[must_use]
    pub fn new(name: &'static str, description: &'static str, pattern: &str) -> Self {
        Self {
            name,
            description,
            regex: Regex::new(pattern).expect("Invalid regex pattern"),
        }
    }

    /// Check if the text matches this pattern.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Replace every match with the placeholder.
    #[must_use]
    pub fn redact(&self, text: &str, placeholder: &str) -> String {
        self.regex.replace_all(text, placeholder).to_string()
    }
}

/// Get all built-in scrub patterns.
#[must_use]
pub fn builtin_patterns() -> Vec<ScrubPattern> {
    vec![
        ScrubPattern::new(
            "bearer_token",
            "Bearer authentication tokens",
            r"(?i)bearer\s+[a-zA-Z0-9_.=-]+",
        ),
        ScrubPattern::new(
            "secret_query_param",
            "Credential-bearing query parameters (token=, api_key=, session=)",
            r"(?i)\b(?:access_token|id_token|refresh_token|token|api[_-]?key|apikey|session(?:id)?|sid|auth)=[^&#\s]+",
        ),
        ScrubPattern::new(
            "password_field",
            "Password assignments",
            r#"(?i)(password|passwd|pwd|secret)\s*[:=]\s*['"]?[^\s'"&]{4,}['"]?"#,
        ),
        ScrubPattern::new(
            "email",
            "Email addresses",
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
        ),
        ScrubPattern::new(
            "credit_card",
            "Credit card numbers (Visa, MasterCard, Amex, Discover)",
            r"\b(?:4[0-9]{12}(?:[0-9]{3})?|5[1-5][0-9]{14}|3[47][0-9]{13}|6(?:011|5[0-9]{2})[0-9]{12})\b",
        ),
        ScrubPattern::new(
            "jwt",
            "JSON Web Tokens",
            r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
        ),
    ]
}
