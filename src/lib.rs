//! # Stream Ingest Library
//!
//! HTTP event ingestion: a versioned definition store of branches, sources
//! and sinks over a revisioned key-value store, and a data plane that routes
//! each received record to the enabled sinks of the matching sources.

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod definition;
pub mod error;
pub mod handlers;
pub mod kv;
pub mod models;
pub mod repositories;
pub mod server;
pub mod sink;
pub mod source;
pub mod telemetry;
pub use migration;
