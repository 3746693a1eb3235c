//! `telepipe` - encrypted, prioritized browser telemetry
//!
//! The client half batches events per priority, encrypts each batch off the
//! collection path with AES-CBC, and sends ciphertext in priority order with
//! bounded retries. The server half decrypts fail-closed and aggregates
//! events into a time-bucketed metric cache with per-key single writers.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cache;
pub mod cli;
pub mod collector;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod logging;
pub mod pipeline;
pub mod privacy;
pub mod record;
pub mod server;
pub mod storage;
pub mod transport;

pub use cache::{CacheEntry, CacheKey, MetricCache};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, MetricType};
pub use logging::init_logging;
pub use pipeline::{Pipeline, PipelineHandle, PipelineStats};
pub use record::{Priority, ProcessingRecord};
pub use storage::{DeadLetterStore, DeadLetterStats};
