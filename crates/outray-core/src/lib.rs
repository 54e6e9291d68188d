//! Outray Core Library
//!
//! Shared functionality for Outray components:
//! - `outray.toml` tunnel configuration loading and validation
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{GlobalConfig, LoadedConfig, ParsedTunnel, load_config, parse_config};
pub use error::{Error, Result};
