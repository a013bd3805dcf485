// SSE Metadata Stripping
//
// Incremental parser over the provider's event stream. Tool-use input deltas
// are held back until their block stops, the metadata fields are pulled out
// and stored, and the cleaned input is re-emitted as one synthetic delta.

use crate::metadata::{MetadataStore, ToolMetadata, DISPLAY_NAME_FIELD, INTENT_FIELD};
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// In-flight tool_use content block.
#[derive(Debug)]
struct TrackedToolBlock {
    id: String,
    name: String,
    index: u64,
    buffered_json: String,
}

/// One logical SSE event, accumulated line by line. Survives chunk boundaries.
#[derive(Default)]
struct PendingEvent {
    raw: Vec<u8>,
    event_type: Option<String>,
    data: Option<String>,
}

enum Disposition {
    Pass,
    Suppress,
    Prepend(Vec<u8>),
}

pub struct SseMetadataStripper {
    store: Arc<MetadataStore>,
    partial_line: Vec<u8>,
    pending: PendingEvent,
    tracked: HashMap<u64, TrackedToolBlock>,
}

impl SseMetadataStripper {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            partial_line: Vec::new(),
            pending: PendingEvent::default(),
            tracked: HashMap::new(),
        }
    }

    /// Feeds one chunk of raw bytes, returns whatever is ready to forward.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = std::mem::take(&mut self.partial_line);
        buf.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos + 1;
            self.handle_line(&buf[start..end], &mut out);
            start = end;
        }

        buf.drain(..start);
        self.partial_line = buf;
        out
    }

    /// End of stream: processes the trailing partial line and flushes blocks that never stopped.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();

        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            self.handle_line(&line, &mut out);
        }
        if !self.pending.raw.is_empty() {
            self.dispatch(b"", &mut out);
        }

        let mut leftovers: Vec<TrackedToolBlock> = self.tracked.drain().map(|(_, b)| b).collect();
        leftovers.sort_by_key(|b| b.index);
        for block in leftovers {
            tracing::debug!(id = %block.id, name = %block.name, "flushing tool block that never stopped");
            out.extend(self.finish_block(block));
        }

        out
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        let content = line.strip_suffix(b"\n").unwrap_or(line);
        let content = content.strip_suffix(b"\r").unwrap_or(content);

        if content.is_empty() {
            if self.pending.raw.is_empty() {
                out.extend_from_slice(line);
            } else {
                self.dispatch(line, out);
            }
            return;
        }

        self.pending.raw.extend_from_slice(line);

        let text = String::from_utf8_lossy(content);
        if text.starts_with(':') {
            return;
        }
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*text, ""),
        };

        match field {
            "event" => self.pending.event_type = Some(value.to_string()),
            "data" => match self.pending.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.pending.data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    fn dispatch(&mut self, terminator: &[u8], out: &mut Vec<u8>) {
        let event = std::mem::take(&mut self.pending);
        let mut raw = event.raw;
        raw.extend_from_slice(terminator);

        match self.process(event.event_type.as_deref(), event.data.as_deref()) {
            Disposition::Pass => out.extend(raw),
            Disposition::Suppress => {}
            Disposition::Prepend(synthetic) => {
                out.extend(synthetic);
                out.extend(raw);
            }
        }
    }

    fn process(&mut self, event_type: Option<&str>, data: Option<&str>) -> Disposition {
        let Some(data) = data else {
            return Disposition::Pass;
        };
        let Ok(json) = serde_json::from_str::<Value>(data) else {
            return Disposition::Pass;
        };

        let kind = event_type
            .or_else(|| json.get("type").and_then(|t| t.as_str()))
            .unwrap_or("");
        let index = json.get("index").and_then(|i| i.as_u64());

        match (kind, index) {
            ("content_block_start", Some(index)) => {
                if let Some(block) = tool_use_block(&json, index) {
                    tracing::debug!(id = %block.id, name = %block.name, index, "tracking tool_use block");
                    self.tracked.insert(index, block);
                }
                Disposition::Pass
            }
            ("content_block_delta", Some(index)) => {
                let Some(block) = self.tracked.get_mut(&index) else {
                    return Disposition::Pass;
                };
                let delta = json.get("delta");
                if delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) != Some("input_json_delta") {
                    return Disposition::Pass;
                }
                match delta.and_then(|d| d.get("partial_json")).and_then(|p| p.as_str()) {
                    Some(partial) => {
                        block.buffered_json.push_str(partial);
                        Disposition::Suppress
                    }
                    None => Disposition::Pass,
                }
            }
            ("content_block_stop", Some(index)) => match self.tracked.remove(&index) {
                Some(block) => Disposition::Prepend(self.finish_block(block)),
                None => Disposition::Pass,
            },
            _ => Disposition::Pass,
        }
    }

    /// Builds the single synthetic delta for a finished block, storing its metadata on the way.
    fn finish_block(&self, block: TrackedToolBlock) -> Vec<u8> {
        if block.buffered_json.is_empty() {
            return Vec::new();
        }

        let cleaned = match serde_json::from_str::<Value>(&block.buffered_json) {
            Ok(mut input) => {
                if let Some(metadata) = take_metadata(&mut input) {
                    self.store.set(&block.id, metadata);
                }
                serde_json::to_string(&input).unwrap_or(block.buffered_json)
            }
            Err(e) => {
                tracing::debug!(id = %block.id, error = %e, "tool input is not valid JSON, forwarding raw");
                block.buffered_json
            }
        };

        synthetic_delta(block.index, &cleaned)
    }
}

fn tool_use_block(json: &Value, index: u64) -> Option<TrackedToolBlock> {
    let block = json.get("content_block")?;
    if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
        return None;
    }
    Some(TrackedToolBlock {
        id: block.get("id")?.as_str()?.to_string(),
        name: block.get("name")?.as_str()?.to_string(),
        index,
        buffered_json: String::new(),
    })
}

/// Removes both metadata fields from a tool input. `None` when neither carried a string.
pub fn take_metadata(input: &mut Value) -> Option<ToolMetadata> {
    let obj = input.as_object_mut()?;
    let intent = obj.shift_remove(INTENT_FIELD);
    let display_name = obj.shift_remove(DISPLAY_NAME_FIELD);

    let as_string = |v: Option<Value>| match v {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let metadata = ToolMetadata::new(as_string(intent), as_string(display_name));
    (!metadata.is_empty()).then_some(metadata)
}

fn synthetic_delta(index: u64, partial_json: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "type": "content_block_delta",
        "index": index,
        "delta": {
            "type": "input_json_delta",
            "partial_json": partial_json,
        },
    });
    format!("event: content_block_delta\ndata: {}\n\n", payload).into_bytes()
}

/// Wraps a response body stream with a fresh stripper.
pub fn strip_metadata_stream<S, E>(
    inner: S,
    mut stripper: SseMetadataStripper,
) -> impl Stream<Item = Result<Bytes, E>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut inner = std::pin::pin!(inner);
        while let Some(item) = inner.next().await {
            match item {
                Ok(bytes) => {
                    let out = stripper.push(&bytes);
                    if !out.is_empty() {
                        yield Ok(Bytes::from(out));
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        let tail = stripper.finish();
        if !tail.is_empty() {
            yield Ok(Bytes::from(tail));
        }
    }
}
