//! Taste Sensor Hub - ingestion, storage and taste classification for an
//! electronic-tongue sensor array.
//!
//! Sensor nodes post periodic readings (gas sensor voltages, color pulse
//! counts, temperature and humidity). The hub stores them in an append-only
//! time series, serves recent and trailing-window views to a polling
//! dashboard, and can ask an external language model to label the latest
//! reading as sour, bitter or salty.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Taste Sensor Hub                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  sensor node                           dashboard              │
//! │      │ POST /api/sensor                    │ GET /api/sensor   │
//! │      ▼                                     ▼                   │
//! │  ┌───────────┐    ┌────────────────┐   ┌───────────┐         │
//! │  │ Ingestion │──▶ │ TimeSeriesStore│◀──│   Query   │         │
//! │  └───────────┘    │  (JSON lines)  │   └───────────┘         │
//! │                   └────────────────┘                          │
//! │  dashboard ── POST /api/predict-taste ──▶ ┌────────────┐      │
//! │                                           │ Classifier │──▶ LLM│
//! │                                           └────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taste_sensor_hub::{IngestionService, QueryService, TimeSeriesStore};
//!
//! let store = Arc::new(TimeSeriesStore::open("readings.jsonl").expect("open store"));
//! let ingestion = IngestionService::new(store.clone());
//! let query = QueryService::new(store);
//!
//! ingestion
//!     .ingest_json(br#"{"mq8_voltage": 1.2, "temperature": 24.0}"#)
//!     .expect("ingest");
//! let newest = query.recent(Some(1)).expect("query");
//! assert_eq!(newest.len(), 1);
//! ```

pub mod config;
pub mod core;
pub mod store;

#[cfg(feature = "classifier")]
pub mod classifier;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use crate::core::{
    IngestError, IngestionService, QueryService, Reading, ReadingPayload, SensorValues, StoredId,
    StoredReading, ValidationError,
};
pub use store::{PersistenceError, SharedStore, TimeSeriesStore};

// Classifier re-exports (when enabled)
#[cfg(feature = "classifier")]
pub use classifier::{
    BlockingTasteClassifier, ClassificationError, ClassifierConfig, Taste, TasteClassifier,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
