//! Shared building blocks for ct-archive-serve
//!
//! This crate holds the pieces every other crate in the workspace needs:
//! the typed runtime configuration, the service-wide error type, and the
//! low-cardinality metrics registry.

pub mod config;
pub mod error;
pub mod metrics;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
