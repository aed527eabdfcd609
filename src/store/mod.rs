//! Durable storage for sensor readings.
//!
//! The store is append-only: readings are never updated or deleted, and all
//! retrieval is ordered by timestamp.

pub mod series;

// Re-export commonly used types
pub use series::{create_shared_store, PersistenceError, SharedStore, TimeSeriesStore, READINGS_FILE};
