//! Validation and persistence of inbound readings.

use crate::core::reading::{Reading, ReadingPayload, StoredId, ValidationError};
use crate::store::{PersistenceError, SharedStore};
use chrono::Utc;

/// Errors returned by ingestion.
#[derive(Debug)]
pub enum IngestError {
    /// The payload was malformed
    Validation(ValidationError),
    /// The store rejected the write
    Persistence(PersistenceError),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Validation(e) => write!(f, "{e}"),
            IngestError::Persistence(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::Validation(e) => Some(e),
            IngestError::Persistence(e) => Some(e),
        }
    }
}

impl From<ValidationError> for IngestError {
    fn from(e: ValidationError) -> Self {
        IngestError::Validation(e)
    }
}

impl From<PersistenceError> for IngestError {
    fn from(e: PersistenceError) -> Self {
        IngestError::Persistence(e)
    }
}

/// Accepts partial readings and appends them to the store.
#[derive(Debug, Clone)]
pub struct IngestionService {
    store: SharedStore,
}

impl IngestionService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Store one reading, stamping it with the current time if it has none.
    pub fn ingest(&self, payload: ReadingPayload) -> Result<StoredId, IngestError> {
        let reading = Reading::from_payload(payload, Utc::now());
        Ok(self.store.append(reading)?)
    }

    /// Decode a JSON request body and store it.
    pub fn ingest_json(&self, body: &[u8]) -> Result<StoredId, IngestError> {
        let payload = ReadingPayload::from_json(body)?;
        self.ingest(payload)
    }
}
