//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Finnhub websocket stream client.
pub mod finnhub;

/// Finnhub webhook ingestion route.
pub mod webhook;

/// In-memory storage adapters.
pub mod persistence;

/// Notification gateway adapters.
pub mod notification;

/// Configuration loaded from the environment.
pub mod config;

/// Shared HTTP listener plumbing.
pub mod http;

/// Health, metrics and admin HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
