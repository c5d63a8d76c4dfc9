//! # Utility Modules
//!
//! Supporting utilities for checksums, logging, and metrics.
//!
//! ## Components
//! - **Checksum**: CRC32C with protocol-ID substitution, the gate against cross-talk
//! - **Logging**: `tracing` subscriber setup from `LoggingConfig`
//! - **Metrics**: Atomic observability counters

pub mod checksum;
pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
