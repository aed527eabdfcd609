//! Read-only views over the reading store for the dashboard.

use crate::core::reading::StoredReading;
use crate::store::{PersistenceError, SharedStore};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Number of readings returned by `recent` when no limit is given.
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Trailing window used by `window` when no duration is given.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Serves "most recent N" and trailing-window queries.
///
/// Every call reads the store; nothing is cached between polls.
#[derive(Debug, Clone)]
pub struct QueryService {
    store: SharedStore,
    default_limit: usize,
    default_window: Duration,
}

impl QueryService {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            default_limit: DEFAULT_RECENT_LIMIT,
            default_window: DEFAULT_WINDOW,
        }
    }

    /// Override the limit used when the caller gives none.
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Override the trailing window used when the caller gives none.
    pub fn with_default_window(mut self, window: Duration) -> Self {
        self.default_window = window;
        self
    }

    pub fn default_window(&self) -> Duration {
        self.default_window
    }

    /// Most recent readings, newest first.
    pub fn recent(&self, limit: Option<usize>) -> Result<Vec<StoredReading>, PersistenceError> {
        self.store.latest(limit.unwrap_or(self.default_limit))
    }

    /// Readings within the trailing window ending now, oldest first.
    pub fn window(&self, last: Option<Duration>) -> Result<Vec<StoredReading>, PersistenceError> {
        self.window_at(Utc::now(), last.unwrap_or(self.default_window))
    }

    /// Readings with `timestamp >= now - last`, oldest first.
    pub fn window_at(
        &self,
        now: DateTime<Utc>,
        last: Duration,
    ) -> Result<Vec<StoredReading>, PersistenceError> {
        // Windows too large for chrono reach back to the earliest representable time.
        let cutoff = chrono::Duration::from_std(last)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.since(cutoff)
    }
}
