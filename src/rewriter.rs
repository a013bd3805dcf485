// Outbound Request Rewriting
//
// Two independent passes over a messages-API request body:
//   1. every tool schema gains required `_intent` / `_displayName` string properties
//   2. assistant tool_use blocks in the history get their stored metadata back,
//      since the stream the SDK saw had it stripped

use crate::config::NAMESPACED_TOOL_PREFIX;
use crate::metadata::{MetadataMap, MetadataStore, DISPLAY_NAME_FIELD, INTENT_FIELD};
use serde_json::{json, Map, Value};

const INTENT_DESCRIPTION: &str =
    "Brief explanation of why you are calling this tool and what you expect to learn or change (one sentence).";
const DISPLAY_NAME_DESCRIPTION: &str =
    "Short human-friendly label for this tool call, 2-5 words (e.g. \"Search project docs\").";

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("request body is not UTF-8")]
    NotUtf8,
    #[error("request body is not JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which tools get the metadata fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolFilter {
    #[default]
    All,
    /// Only tools whose name starts with the prefix (e.g. MCP tools).
    Prefixed(String),
}

impl ToolFilter {
    pub fn from_flag(namespaced_only: bool) -> Self {
        if namespaced_only {
            ToolFilter::Prefixed(NAMESPACED_TOOL_PREFIX.to_string())
        } else {
            ToolFilter::All
        }
    }

    fn matches(&self, tool_name: &str) -> bool {
        match self {
            ToolFilter::All => true,
            ToolFilter::Prefixed(prefix) => tool_name.starts_with(prefix.as_str()),
        }
    }
}

/// Adds the metadata properties to each matching tool's input schema. Idempotent.
/// Returns the number of tools whose schema changed.
pub fn augment_tool_schemas(body: &mut Value, filter: &ToolFilter) -> usize {
    let Some(tools) = body.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return 0;
    };

    let mut changed = 0;
    for tool in tools.iter_mut() {
        let name = tool.get("name").and_then(|n| n.as_str()).unwrap_or("");
        if !filter.matches(name) {
            continue;
        }
        let Some(schema) = tool.get_mut("input_schema").and_then(|s| s.as_object_mut()) else {
            continue;
        };
        if augment_schema(schema) {
            changed += 1;
        }
    }
    changed
}

fn augment_schema(schema: &mut Map<String, Value>) -> bool {
    let Some(properties) = schema.get_mut("properties").and_then(|p| p.as_object_mut()) else {
        return false;
    };

    let mut changed = false;
    for (field, description) in [
        (INTENT_FIELD, INTENT_DESCRIPTION),
        (DISPLAY_NAME_FIELD, DISPLAY_NAME_DESCRIPTION),
    ] {
        if !properties.contains_key(field) {
            properties.insert(
                field.to_string(),
                json!({ "type": "string", "description": description }),
            );
            changed = true;
        }
    }

    let required = schema
        .entry("required")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(required) = required.as_array_mut() else {
        return changed;
    };
    for field in [INTENT_FIELD, DISPLAY_NAME_FIELD] {
        if !required.iter().any(|r| r.as_str() == Some(field)) {
            required.push(Value::String(field.to_string()));
            changed = true;
        }
    }

    changed
}

/// Puts stored metadata back into historical assistant tool_use inputs.
/// Blocks already carrying either field are left alone. Returns the number of blocks touched.
pub fn reinject_history(body: &mut Value, store: &MetadataStore) -> usize {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return 0;
    };

    // One full file read at most, shared by every miss in this scan.
    let mut disk: Option<MetadataMap> = None;
    let mut injected = 0;

    for message in messages.iter_mut() {
        if message.get("role").and_then(|r| r.as_str()) != Some("assistant") {
            continue;
        }
        let Some(content) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };

        for block in content.iter_mut() {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                continue;
            }
            let Some(id) = block.get("id").and_then(|i| i.as_str()).map(str::to_string) else {
                continue;
            };
            let Some(input) = block.get_mut("input").and_then(|i| i.as_object_mut()) else {
                continue;
            };
            if input.contains_key(INTENT_FIELD) || input.contains_key(DISPLAY_NAME_FIELD) {
                continue;
            }

            let metadata = match store.cached(&id) {
                Some(hit) => Some(hit),
                None => disk.get_or_insert_with(|| store.read_disk()).get(&id).cloned(),
            };
            let Some(metadata) = metadata else {
                continue;
            };

            let mut touched = false;
            if let Some(intent) = metadata.intent {
                input.insert(INTENT_FIELD.to_string(), Value::String(intent));
                touched = true;
            }
            if let Some(display_name) = metadata.display_name {
                input.insert(DISPLAY_NAME_FIELD.to_string(), Value::String(display_name));
                touched = true;
            }
            if touched {
                injected += 1;
            }
        }
    }

    injected
}

/// Applies both passes to a raw body and re-serializes it.
pub fn rewrite_request_body(
    body: &[u8],
    store: &MetadataStore,
    filter: &ToolFilter,
) -> Result<Vec<u8>, RewriteError> {
    let text = std::str::from_utf8(body).map_err(|_| RewriteError::NotUtf8)?;
    let mut json: Value = serde_json::from_str(text)?;

    let schemas = augment_tool_schemas(&mut json, filter);
    let history = reinject_history(&mut json, store);
    tracing::debug!(schemas, history, "rewrote messages request");

    Ok(serde_json::to_vec(&json)?)
}
