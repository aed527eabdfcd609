//! Core functionality for the taste sensor hub.
//!
//! This module contains:
//! - Reading types and schema-tolerant payload decoding
//! - Ingestion of inbound readings into the store
//! - Recent and trailing-window queries for the dashboard

pub mod ingest;
pub mod query;
pub mod reading;

// Re-export commonly used types
pub use ingest::{IngestError, IngestionService};
pub use query::{QueryService, DEFAULT_RECENT_LIMIT, DEFAULT_WINDOW};
pub use reading::{
    Reading, ReadingPayload, SensorValues, StoredId, StoredReading, ValidationError,
};
