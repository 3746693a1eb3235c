//! Telemetry event kinds.
//!
//! Browser payloads arrive as JSON and are parsed into the closed [`Event`]
//! union at the ingress boundary. Anything that does not parse or validate
//! is rejected there and never reaches a batch.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::normalize_url;
use crate::error::{Error, Result};
use crate::privacy::Scrubber;
use crate::record::Priority;

/// Longest URL accepted at ingress.
pub const MAX_URL_LEN: usize = 2048;

/// Metric family recorded in a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Error occurrences; each event contributes a value of 1.
    Error,
    /// Performance timings in milliseconds.
    Performance,
    /// Interaction counts.
    Interaction,
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Performance => write!(f, "performance"),
            Self::Interaction => write!(f, "interaction"),
        }
    }
}

/// An uncaught error or rejected promise reported by the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Indicator the error is counted under.
    pub indicator_id: u32,
    /// Page or resource URL the error came from.
    pub url: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Error message.
    pub message: String,
    /// Stack trace, if the browser supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// A performance mark or measured duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    /// Indicator the sample belongs to.
    pub indicator_id: u32,
    /// Page or resource URL.
    pub url: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Mark or measure name (e.g. `first-contentful-paint`).
    pub name: String,
    /// Measured value in milliseconds.
    pub value: f64,
}

/// A click or other user interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    /// Indicator the interaction is counted under.
    pub indicator_id: u32,
    /// Page URL.
    pub url: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Description of the element interacted with.
    pub target: String,
    /// Optional weight; defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// A telemetry event, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// See [`ErrorEvent`].
    Error(ErrorEvent),
    /// See [`PerformanceSample`].
    Performance(PerformanceSample),
    /// See [`InteractionEvent`].
    Interaction(InteractionEvent),
}

impl Event {
    /// Parse and validate a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the payload is not a known event
    /// kind or fails validation.
    pub fn parse(payload: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(payload)
            .map_err(|e| Error::invalid_event(format!("unparseable payload: {e}")))?;
        event.validate()?;
        Ok(event)
    }

    /// Indicator identifier.
    #[must_use]
    pub fn indicator_id(&self) -> u32 {
        match self {
            Self::Error(e) => e.indicator_id,
            Self::Performance(p) => p.indicator_id,
            Self::Interaction(i) => i.indicator_id,
        }
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Error(e) => &e.url,
            Self::Performance(p) => &p.url,
            Self::Interaction(i) => &i.url,
        }
    }

    /// Event time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Error(e) => e.timestamp,
            Self::Performance(p) => p.timestamp,
            Self::Interaction(i) => i.timestamp,
        }
    }

    /// Event time as a UTC datetime, if representable.
    #[must_use]
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp()).single()
    }

    /// Value appended to the metric series.
    #[must_use]
    pub fn value(&self) -> f64 {
        match self {
            Self::Error(_) => 1.0,
            Self::Performance(p) => p.value,
            Self::Interaction(i) => i.value.unwrap_or(1.0),
        }
    }

    /// Metric family this event feeds.
    #[must_use]
    pub fn metric_type(&self) -> MetricType {
        match self {
            Self::Error(_) => MetricType::Error,
            Self::Performance(_) => MetricType::Performance,
            Self::Interaction(_) => MetricType::Interaction,
        }
    }

    /// Priority this kind of event is sent at when the caller does not say.
    #[must_use]
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Error(_) => Priority::Error,
            Self::Performance(_) => Priority::Performance,
            Self::Interaction(_) => Priority::UserBehavior,
        }
    }

    /// Check the structural invariants every event must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.indicator_id() == 0 {
            return Err(Error::invalid_event("indicatorId must be positive"));
        }
        let url = self.url();
        if normalize_url(url).is_empty() {
            return Err(Error::invalid_event("url must have a path"));
        }
        if url.len() > MAX_URL_LEN {
            return Err(Error::invalid_event(format!(
                "url longer than {MAX_URL_LEN} bytes"
            )));
        }
        if self.occurred_at().is_none() || self.timestamp() <= 0 {
            return Err(Error::invalid_event(format!(
                "timestamp {} out of range",
                self.timestamp()
            )));
        }

        let value = self.value();
        if !value.is_finite() {
            return Err(Error::invalid_event("value must be finite"));
        }

        match self {
            Self::Error(e) if e.message.is_empty() => {
                Err(Error::invalid_event("error message must not be empty"))
            }
            Self::Performance(p) if p.name.is_empty() => {
                Err(Error::invalid_event("performance sample needs a name"))
            }
            Self::Performance(p) if p.value < 0.0 => {
                Err(Error::invalid_event("performance value must not be negative"))
            }
            _ => Ok(()),
        }
    }

    /// Redact sensitive text in free-form fields and URL query strings.
    pub fn scrub(&mut self, scrubber: &Scrubber) {
        match self {
            Self::Error(e) => {
                e.url = scrubber.scrub(&e.url);
                e.message = scrubber.scrub(&e.message);
                if let Some(stack) = e.stack.as_mut() {
                    *stack = scrubber.scrub(stack);
                }
            }
            Self::Performance(p) => {
                p.url = scrubber.scrub(&p.url);
            }
            Self::Interaction(i) => {
                i.url = scrubber.scrub(&i.url);
                i.target = scrubber.scrub(&i.target);
            }
        }
    }

    /// Serialize to the JSON string carried inside a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_error(indicator_id: u32, url: &str, timestamp: i64) -> Event {
        Event::Error(ErrorEvent {
            indicator_id,
            url: url.to_string(),
            timestamp,
            message: "TypeError: x is undefined".to_string(),
            stack: None,
        })
    }

    #[test]
    fn test_parse_tagged_payloads() {
        let error = Event::parse(
            r#"{"kind":"error","indicatorId":7,"url":"/api/x","timestamp":1700000000000,"message":"boom"}"#,
        )
        .unwrap();
        assert_eq!(error.metric_type(), MetricType::Error);
        assert_eq!(error.indicator_id(), 7);
        assert!((error.value() - 1.0).abs() < f64::EPSILON);

        let perf = Event::parse(
            r#"{"kind":"performance","indicatorId":3,"url":"/","timestamp":1700000000000,"name":"fcp","value":812.5}"#,
        )
        .unwrap();
        assert_eq!(perf.default_priority(), Priority::Performance);
        assert!((perf.value() - 812.5).abs() < f64::EPSILON);

        let click = Event::parse(
            r##"{"kind":"interaction","indicatorId":9,"url":"/cart","timestamp":1700000000000,"target":"#buy"}"##,
        )
        .unwrap();
        assert_eq!(click.default_priority(), Priority::UserBehavior);
        assert!((click.value() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let result = Event::parse(r#"{"kind":"pageview","indicatorId":1,"url":"/","timestamp":1}"#);
        assert!(matches!(result, Err(Error::InvalidEvent { .. })));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(Event::parse("not json").is_err());
    }

    #[test]
    fn test_validate_rejects_query_only_url() {
        assert!(sample_error(1, "?token=x", 1).validate().is_err());
        assert!(sample_error(1, " #frag", 1).validate().is_err());
        assert!(sample_error(1, "/x?token=x", 1).validate().is_ok());
    }

    #[test]
    fn test_validate_rules() {
        assert!(sample_error(0, "/x", 1).validate().is_err());
        assert!(sample_error(1, "  ", 1).validate().is_err());
        assert!(sample_error(1, "/x", 0).validate().is_err());
        assert!(sample_error(1, &"a".repeat(MAX_URL_LEN + 1), 1).validate().is_err());
        assert!(sample_error(1, "/x", 1).validate().is_ok());

        let negative = Event::Performance(PerformanceSample {
            indicator_id: 1,
            url: "/".to_string(),
            timestamp: 1,
            name: "lcp".to_string(),
            value: -3.0,
        });
        assert!(negative.validate().is_err());

        let nan = Event::Interaction(InteractionEvent {
            indicator_id: 1,
            url: "/".to_string(),
            timestamp: 1,
            target: "button".to_string(),
            value: Some(f64::NAN),
        });
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_preserves_kind() {
        let event = sample_error(7, "/api/x", 1_700_000_000_000);
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""kind":"error""#));
        assert!(json.contains(r#""indicatorId":7"#));
        assert_eq!(Event::parse(&json).unwrap(), event);
    }

    #[test]
    fn test_scrub_redacts_message_and_query() {
        let mut event = Event::Error(ErrorEvent {
            indicator_id: 1,
            url: "/login?token=abcdef123456".to_string(),
            timestamp: 1,
            message: "failed for user@example.com".to_string(),
            stack: Some("at f (password=hunter22)".to_string()),
        });
        event.scrub(&Scrubber::new());

        let Event::Error(e) = event else {
            panic!("kind changed");
        };
        assert!(!e.url.contains("abcdef123456"));
        assert!(!e.message.contains("user@example.com"));
        assert!(!e.stack.unwrap().contains("hunter22"));
    }

    #[test]
    fn test_metric_type_display() {
        assert_eq!(MetricType::Error.to_string(), "error");
        assert_eq!(MetricType::Performance.to_string(), "performance");
        assert_eq!(MetricType::Interaction.to_string(), "interaction");
    }
}
