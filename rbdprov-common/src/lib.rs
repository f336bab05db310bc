//! # rbdprov Common
//!
//! Shared utilities for the rbdprov components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use rbdprov_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(pool = "rep_pool_0", "Pool created");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
