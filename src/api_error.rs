// Last API Error Store
//
// Single-slot, read-once record of the most recent 4xx/5xx answer from the
// provider's messages endpoint.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entries older than this are discarded unread.
pub const STALENESS_WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastApiError {
    pub status: u16,
    pub status_text: String,
    pub message: String,
    /// Unix epoch milliseconds.
    #[serde(rename = "timestampMs", alias = "timestamp")]
    pub timestamp: i64,
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub struct ApiErrorStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ApiErrorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the slot. Failures are logged and swallowed.
    pub fn record(&self, status: u16, status_text: &str, message: &str) {
        let entry = LastApiError {
            status,
            status_text: status_text.to_string(),
            message: message.to_string(),
            timestamp: self.clock.now_ms(),
        };

        if let Err(e) = write_entry(&self.path, &entry) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to store API error");
        }
    }

    /// Pops the stored error. The file is removed whether or not it was still fresh.
    pub fn take(&self) -> Option<LastApiError> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let _ = std::fs::remove_file(&self.path);

        let entry: LastApiError = serde_json::from_str(&content).ok()?;
        if self.clock.now_ms().saturating_sub(entry.timestamp) > STALENESS_WINDOW_MS {
            tracing::debug!(status = entry.status, "discarding stale API error");
            return None;
        }
        Some(entry)
    }
}

fn write_entry(path: &Path, entry: &LastApiError) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec(entry)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    pub(crate) struct FixedClock(pub AtomicI64);

    impl FixedClock {
        pub(crate) fn at(ms: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(ms)))
        }

        pub(crate) fn advance(&self, ms: i64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn take_pops_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiErrorStore::with_clock(dir.path().join("api-error.json"), FixedClock::at(1_000));

        store.record(429, "Too Many Requests", "rate limited");

        let first = store.take().expect("first read returns the error");
        assert_eq!(first.status, 429);
        assert_eq!(first.status_text, "Too Many Requests");
        assert_eq!(first.message, "rate limited");
        assert_eq!(first.timestamp, 1_000);

        assert_eq!(store.take(), None);
    }

    #[test]
    fn stale_entry_is_discarded_even_if_unread() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::at(10_000);
        let store = ApiErrorStore::with_clock(dir.path().join("api-error.json"), clock.clone());

        store.record(500, "Internal Server Error", "boom");
        clock.advance(STALENESS_WINDOW_MS + 1);

        assert_eq!(store.take(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn entry_just_inside_window_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::at(10_000);
        let store = ApiErrorStore::with_clock(dir.path().join("api-error.json"), clock.clone());

        store.record(400, "Bad Request", "bad");
        clock.advance(STALENESS_WINDOW_MS);

        assert!(store.take().is_some());
    }

    #[test]
    fn missing_directory_is_created_on_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api-error.json");
        let store = ApiErrorStore::new(&path);

        store.record(401, "Unauthorized", "no key");

        assert!(path.exists());
    }

    #[test]
    fn file_uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiErrorStore::with_clock(dir.path().join("api-error.json"), FixedClock::at(5));
        store.record(503, "Service Unavailable", "overloaded");

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["statusText"], "Service Unavailable");
        assert_eq!(value["timestampMs"], 5);
    }

    #[test]
    fn extreme_timestamp_is_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiErrorStore::with_clock(dir.path().join("api-error.json"), FixedClock::at(1_000));
        std::fs::write(
            store.path(),
            r#"{"status":500,"statusText":"x","message":"m","timestampMs":-9223372036854775808}"#,
        )
        .unwrap();

        assert_eq!(store.take(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn garbage_file_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiErrorStore::with_clock(dir.path().join("api-error.json"), FixedClock::at(1_000));
        std::fs::write(store.path(), r#"{"status":"oops"}"#).unwrap();

        assert_eq!(store.take(), None);
        assert!(!store.path().exists());
    }
}
