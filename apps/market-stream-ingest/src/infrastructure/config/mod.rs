//! Configuration Module
//!
//! Environment-driven configuration for the ingest service.

mod settings;

pub use settings::{
    ConfigError, Credentials, DEFAULT_WEBSOCKET_URL, IngestConfig, ServerSettings, StreamSettings,
};
