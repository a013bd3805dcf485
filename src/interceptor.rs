// Messages API Interceptor
//
// The single chokepoint every outbound provider call goes through. Calls to
// the messages endpoint get their body rewritten, their event stream
// stripped, and their 4xx/5xx answers captured. Everything else is sent as-is.

use crate::api_error::ApiErrorStore;
use crate::config::{BaseUrl, GatewayConfig};
use crate::metadata::MetadataStore;
use crate::rewriter::{rewrite_request_body, ToolFilter};
use crate::sse::{strip_metadata_stream, SseMetadataStripper};
use flate2::read::GzDecoder;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Version};
use std::io::Read;
use std::sync::Arc;
use url::Url;

const MAX_ERROR_MESSAGE_LEN: usize = 2000;

pub struct Interceptor {
    client: reqwest::Client,
    base_url: BaseUrl,
    store: Arc<MetadataStore>,
    errors: Arc<ApiErrorStore>,
    filter: ToolFilter,
}

impl Interceptor {
    pub fn new(
        client: reqwest::Client,
        base_url: BaseUrl,
        store: Arc<MetadataStore>,
        errors: Arc<ApiErrorStore>,
    ) -> Self {
        Self {
            client,
            base_url,
            store,
            errors,
            filter: ToolFilter::default(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let store = match &config.session_dir {
            Some(dir) => MetadataStore::open(dir),
            None => MetadataStore::new(),
        };
        Self::new(
            reqwest::Client::new(),
            config.base_url.clone(),
            Arc::new(store),
            Arc::new(ApiErrorStore::new(config.api_error_path())),
        )
        .with_tool_filter(ToolFilter::from_flag(config.namespaced_tools_only))
    }

    pub fn with_tool_filter(mut self, filter: ToolFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn errors(&self) -> &Arc<ApiErrorStore> {
        &self.errors
    }

    pub fn base_url(&self) -> String {
        self.base_url.resolve()
    }

    /// True for `<base>/.../messages` on the currently configured provider origin.
    pub fn is_messages_endpoint(&self, url: &Url) -> bool {
        let Ok(base) = Url::parse(&self.base_url.resolve()) else {
            return false;
        };

        let same_origin = url.scheme() == base.scheme()
            && url.host_str() == base.host_str()
            && url.port_or_known_default() == base.port_or_known_default();
        let path = url.path().trim_end_matches('/');

        same_origin
            && path.starts_with(base.path().trim_end_matches('/'))
            && path.ends_with("/messages")
    }

    pub async fn execute(&self, mut request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        if !self.is_messages_endpoint(request.url()) {
            return self.client.execute(request).await;
        }

        let is_post = request.method() == Method::POST;
        if is_post {
            self.rewrite_body(&mut request);
        }

        let response = self.client.execute(request).await?;
        let status = response.status();

        if status.is_client_error() || status.is_server_error() {
            return Ok(self.capture_error(response).await);
        }
        if is_post && is_event_stream(response.headers()) {
            return Ok(self.strip_response(response));
        }
        Ok(response)
    }

    /// Leaves the request untouched unless the rewrite fully succeeds.
    fn rewrite_body(&self, request: &mut reqwest::Request) {
        let Some(original) = request.body().and_then(|b| b.as_bytes()) else {
            return;
        };

        match rewrite_request_body(original, &self.store, &self.filter) {
            Ok(rewritten) => {
                // Body length changed; let the client recompute framing.
                request.headers_mut().remove(CONTENT_LENGTH);
                *request.body_mut() = Some(reqwest::Body::from(rewritten));
            }
            Err(e) => {
                tracing::warn!(url = %request.url(), error = %e, "sending messages request unmodified");
            }
        }
    }

    fn strip_response(&self, response: reqwest::Response) -> reqwest::Response {
        let status = response.status();
        let version = response.version();
        let mut headers = response.headers().clone();
        headers.remove(CONTENT_LENGTH);

        let stripper = SseMetadataStripper::new(self.store.clone());
        let body = strip_metadata_stream(response.bytes_stream(), stripper);
        rebuild_response(status, version, headers, reqwest::Body::wrap_stream(body))
    }

    /// Buffers the error body, records it, and hands the caller an identical response.
    async fn capture_error(&self, response: reqwest::Response) -> reqwest::Response {
        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let status_text = status.canonical_reason().unwrap_or("");

        match response.bytes().await {
            Ok(body) => {
                let message = extract_error_message(status, &headers, &body);
                tracing::debug!(status = status.as_u16(), %message, "captured provider error");
                self.errors.record(status.as_u16(), status_text, &message);
                rebuild_response(status, version, headers, reqwest::Body::from(body))
            }
            Err(e) => {
                self.errors
                    .record(status.as_u16(), status_text, &status_line(status));
                let message = e.to_string();
                let failed = futures::stream::once(async move {
                    Err::<axum::body::Bytes, _>(std::io::Error::new(std::io::ErrorKind::Other, message))
                });
                rebuild_response(status, version, headers, reqwest::Body::wrap_stream(failed))
            }
        }
    }
}

fn rebuild_response(
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: reqwest::Body,
) -> reqwest::Response {
    let mut response = axum::http::Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    reqwest::Response::from(response)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Decompress gzip data
fn decompress_gzip(data: &[u8]) -> Option<String> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = String::new();
    match decoder.read_to_string(&mut decompressed) {
        Ok(_) => Some(decompressed),
        Err(_) => None,
    }
}

fn status_line(status: StatusCode) -> String {
    format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

/// Provider JSON error shape first, then raw text, then the status line.
fn extract_error_message(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> String {
    let is_gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);

    let text = if is_gzip {
        decompress_gzip(body).unwrap_or_else(|| String::from_utf8_lossy(body).to_string())
    } else {
        String::from_utf8_lossy(body).to_string()
    };

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
        let message = json
            .pointer("/error/message")
            .or_else(|| json.get("message"))
            .or_else(|| json.get("error"))
            .and_then(|m| m.as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return status_line(status);
    }
    trimmed.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}
