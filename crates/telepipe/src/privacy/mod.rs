//! Privacy scrubbing for event payloads.
//!
//! Browser telemetry routinely carries secrets it should not: session tokens
//! in query strings, emails in error messages, bearer headers echoed into
//! stack traces. Every event passes through a [`Scrubber`] before it is
//! serialized into a batch, so nothing matching these patterns is encrypted,
//! transmitted or aggregated.
//!
//! # Example
//!
//! ```
//! use telepipe::privacy::Scrubber;
//!
//! let scrubber = Scrubber::new();
//! let url = scrubber.scrub("/callback?token=abc123&page=2");
//! assert_eq!(url, "/callback?[REDACTED]&page=2");
//! ```

mod filter;
mod patterns;

pub use filter::{ScrubConfig, Scrubber, REDACTION_PLACEHOLDER};
pub use patterns::{builtin_patterns, ScrubPattern};
