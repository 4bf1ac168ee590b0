//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for stores, notifications and the live stream.
pub mod ports;

/// Subscription registry and trade ingestion pipeline.
pub mod services;
