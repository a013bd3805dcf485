// Tool-call Metadata Store
//
// Maps tool_use ids to the intent/display name the model supplied for them.
// Backed by one JSON file per session directory so a separate process can
// read what this one captured.

use crate::config::{METADATA_FILE_NAME, SESSION_DIR_ENV};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Property names smuggled into every tool schema and stripped from the stream.
pub const INTENT_FIELD: &str = "_intent";
pub const DISPLAY_NAME_FIELD: &str = "_displayName";

/// Metadata stripped from a single tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl ToolMetadata {
    pub fn new(intent: Option<String>, display_name: Option<String>) -> Self {
        Self {
            intent,
            display_name,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intent.is_none() && self.display_name.is_none()
    }
}

pub type MetadataMap = HashMap<String, ToolMetadata>;

#[derive(Default)]
struct StoreState {
    session_dir: Option<PathBuf>,
    memory: MetadataMap,
    /// Mirrors the file on disk. `None` until first loaded.
    file_shadow: Option<MetadataMap>,
}

/// Thread-safe metadata store
///
/// Every disk failure degrades to "no metadata known"; nothing here returns an error.
#[derive(Default)]
pub struct MetadataStore {
    state: Mutex<StoreState>,
}

impl MetadataStore {
    /// An unbound store. Writes stay in memory until a session directory is set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let store = Self::new();
        store.set_session_directory(dir);
        store
    }

    /// Binds to the session directory named by the environment, if any.
    pub fn from_env() -> Self {
        match std::env::var(SESSION_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => Self::open(dir),
            _ => Self::new(),
        }
    }

    /// Rebinds to a new session and eagerly loads whatever is already on disk.
    pub fn set_session_directory(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        let on_disk = read_map(&metadata_path(&dir));
        tracing::debug!(
            dir = %dir.display(),
            entries = on_disk.len(),
            "metadata store bound to session"
        );

        let mut state = self.lock();
        state.memory = on_disk.clone();
        state.file_shadow = Some(on_disk);
        state.session_dir = Some(dir);
    }

    /// Unbinds the store and drops all cached entries. The file is left in place.
    pub fn close(&self) {
        let mut state = self.lock();
        *state = StoreState::default();
    }

    pub fn session_directory(&self) -> Option<PathBuf> {
        self.lock().session_dir.clone()
    }

    pub fn set(&self, tool_use_id: &str, metadata: ToolMetadata) {
        let mut state = self.lock();
        state.memory.insert(tool_use_id.to_string(), metadata.clone());

        let Some(dir) = state.session_dir.clone() else {
            return;
        };
        let path = metadata_path(&dir);

        // Loaded once so a resumed session's existing entries survive the rewrite.
        let shadow = state.file_shadow.get_or_insert_with(|| read_map(&path));
        shadow.insert(tool_use_id.to_string(), metadata);

        if let Err(e) = write_map_atomic(&path, shadow) {
            tracing::debug!(path = %path.display(), error = %e, "failed to persist tool metadata");
        }
    }

    pub fn get(&self, tool_use_id: &str) -> Option<ToolMetadata> {
        let dir = {
            let state = self.lock();
            if let Some(hit) = state.memory.get(tool_use_id) {
                return Some(hit.clone());
            }
            state.session_dir.clone()?
        };

        read_map(&metadata_path(&dir)).remove(tool_use_id)
    }

    pub fn delete(&self, tool_use_id: &str) {
        let mut state = self.lock();
        state.memory.remove(tool_use_id);

        let Some(dir) = state.session_dir.clone() else {
            return;
        };
        let path = metadata_path(&dir);

        let shadow = state.file_shadow.get_or_insert_with(|| read_map(&path));
        if shadow.remove(tool_use_id).is_none() {
            return;
        }
        if let Err(e) = write_map_atomic(&path, shadow) {
            tracing::debug!(path = %path.display(), error = %e, "failed to rewrite tool metadata");
        }
    }

    /// In-memory lookup only.
    pub(crate) fn cached(&self, tool_use_id: &str) -> Option<ToolMetadata> {
        self.lock().memory.get(tool_use_id).cloned()
    }

    /// Full read of the session file, bypassing every cache.
    pub(crate) fn read_disk(&self) -> MetadataMap {
        match self.session_directory() {
            Some(dir) => read_map(&metadata_path(&dir)),
            None => MetadataMap::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // A poisoned lock only means another writer panicked mid-update; the map is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn metadata_path(session_dir: &Path) -> PathBuf {
    session_dir.join(METADATA_FILE_NAME)
}

fn read_map(path: &Path) -> MetadataMap {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return MetadataMap::new(),
    };
    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "ignoring unreadable tool metadata file");
            MetadataMap::new()
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write-to-temp-then-rename so readers never observe a half-written file.
/// Each write gets its own temp name, even between stores in one process.
fn write_map_atomic(path: &Path, map: &MetadataMap) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(map)?;
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
