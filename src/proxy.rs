// Local Gateway Proxy
//
// Agents point their provider base URL at this server. Every forwarded call
// goes through the Interceptor; a couple of `/_toolgate` routes expose the
// captured metadata and last error to sibling processes.

use crate::config::GatewayConfig;
use crate::interceptor::Interceptor;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;

// Recomputed by the client, or would ask upstream for an encoding the stripper can't read.
const SKIP_REQUEST_HEADERS: [&str; 3] = ["host", "content-length", "accept-encoding"];
const SKIP_RESPONSE_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

#[derive(Clone)]
struct ProxyState {
    client: Client,
    interceptor: Arc<Interceptor>,
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn metadata_handler(
    State(state): State<ProxyState>,
    Path(tool_use_id): Path<String>,
) -> Response {
    match state.interceptor.store().get(&tool_use_id) {
        Some(metadata) => Json(metadata).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn last_error_handler(State(state): State<ProxyState>) -> Response {
    match state.interceptor.errors().take() {
        Some(error) => Json(error).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}

async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let start_time = Instant::now();

    let method = req.method().clone();
    let full_path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();
    let target_url = format!("{}{}", state.interceptor.base_url(), full_path);

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {}", e),
            );
        }
    };

    let mut outbound = state.client.request(method.clone(), &target_url);
    for (name, value) in headers.iter() {
        if !SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            outbound = outbound.header(name, value);
        }
    }
    if !body_bytes.is_empty() {
        outbound = outbound.body(body_bytes);
    }

    let request = match outbound.build() {
        Ok(request) => request,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {}", e));
        }
    };

    tracing::debug!(%method, url = %target_url, "forwarding to upstream");
    let response = match state.interceptor.execute(request).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(url = %target_url, error = %e, "upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, format!("Proxy error: {}", e));
        }
    };

    let status = response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if !SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            response_headers.append(name.clone(), value.clone());
        }
    }
    let path_for_log = full_path.clone();
    let upstream = response.bytes_stream().map(|result| {
        result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    });
    let logged_stream = async_stream::stream! {
        let mut inner = std::pin::pin!(upstream);
        let mut chunk_count = 0usize;
        while let Some(item) = inner.next().await {
            chunk_count += 1;
            yield item;
        }
        tracing::debug!(
            path = %path_for_log,
            status = status.as_u16(),
            chunks = chunk_count,
            latency_ms = start_time.elapsed().as_millis() as u64,
            "response forwarded"
        );
    };

    let mut resp = Response::new(Body::from_stream(logged_stream));
    *resp.status_mut() = status;
    *resp.headers_mut() = response_headers;
    resp
}

pub fn router(interceptor: Arc<Interceptor>) -> Router {
    let state = ProxyState {
        client: Client::new(),
        interceptor,
    };

    Router::new()
        .route("/", get(health_handler))
        .route("/_toolgate/metadata/:tool_use_id", get(metadata_handler))
        .route("/_toolgate/last-error", get(last_error_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Serves until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    interceptor: Arc<Interceptor>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(interceptor);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            tracing::info!("shutdown signal received, stopping proxy server");
        })
        .await
}

/// Binds the configured port, retrying while it is busy, then serves.
pub async fn start_proxy_server(
    config: &GatewayConfig,
    interceptor: Arc<Interceptor>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = loop {
        match TcpListener::bind(addr).await {
            Ok(l) => break l,
            Err(e) => {
                tracing::error!(port = config.port, error = %e, "failed to bind proxy port");
                if *shutdown.borrow() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };

    tracing::info!(
        "proxy server running on http://{}, forwarding to {}",
        addr,
        interceptor.base_url()
    );
    serve(listener, interceptor, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_error::ApiErrorStore;
    use crate::config::BaseUrl;
    use crate::metadata::{MetadataStore, ToolMetadata};
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Running {
        upstream: MockServer,
        interceptor: Arc<Interceptor>,
        base: String,
        stop: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    async fn start() -> Running {
        let upstream = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let interceptor = Arc::new(Interceptor::new(
            Client::new(),
            BaseUrl::Fixed(upstream.uri()),
            Arc::new(MetadataStore::open(dir.path().join("session"))),
            Arc::new(ApiErrorStore::new(dir.path().join("api-error.json"))),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, rx) = watch::channel(false);
        tokio::spawn(serve(listener, interceptor.clone(), rx));

        Running {
            upstream,
            interceptor,
            base,
            stop,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn health_route_answers_locally() {
        let gw = start().await;
        let body: Value = reqwest::get(format!("{}/", gw.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"status": "healthy"}));
        assert!(gw.upstream.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_call_is_forwarded_through_the_interceptor() {
        let gw = start().await;
        let sse = concat!(
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_p\",\"name\":\"Bash\",\"input\":{}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"command\\\":\\\"ls\\\",\\\"_intent\\\":\\\"list files\\\"}\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&gw.upstream)
            .await;

        let response = Client::new()
            .post(format!("{}/v1/messages", gw.base))
            .header("x-api-key", "sk-test")
            .json(&json!({"tools": [{"name": "Bash", "input_schema": {"type": "object", "properties": {"command": {"type": "string"}}}}], "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(!text.contains("_intent"));

        let received = gw.upstream.received_requests().await.unwrap();
        assert_eq!(received[0].headers.get("x-api-key").unwrap(), "sk-test");
        let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert!(sent["tools"][0]["input_schema"]["properties"]["_intent"].is_object());

        let metadata: ToolMetadata = reqwest::get(format!("{}/_toolgate/metadata/toolu_p", gw.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metadata.intent.as_deref(), Some("list files"));
    }

    #[tokio::test]
    async fn unknown_metadata_is_404() {
        let gw = start().await;
        let status = reqwest::get(format!("{}/_toolgate/metadata/toolu_none", gw.base))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn last_error_route_pops_once() {
        let gw = start().await;
        gw.interceptor.errors().record(529, "", "Overloaded");

        let first = reqwest::get(format!("{}/_toolgate/last-error", gw.base))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body: Value = first.json().await.unwrap();
        assert_eq!(body["status"], 529);
        assert_eq!(body["message"], "Overloaded");

        let second = reqwest::get(format!("{}/_toolgate/last-error", gw.base))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let gw = start().await;
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_url = format!("http://{}", dead.local_addr().unwrap());
        drop(dead);

        let interceptor = Arc::new(Interceptor::new(
            Client::new(),
            BaseUrl::Fixed(dead_url),
            gw.interceptor.store().clone(),
            gw.interceptor.errors().clone(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (_stop, rx) = watch::channel(false);
        tokio::spawn(serve(listener, interceptor, rx));

        let status = Client::new()
            .post(format!("{}/v1/messages", base))
            .body("{}")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_server() {
        let upstream = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let interceptor = Arc::new(Interceptor::new(
            Client::new(),
            BaseUrl::Fixed(upstream.uri()),
            Arc::new(MetadataStore::new()),
            Arc::new(ApiErrorStore::new(dir.path().join("api-error.json"))),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop, rx) = watch::channel(false);
        let handle = tokio::spawn(serve(listener, interceptor, rx));

        stop.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server stops");
        assert!(result.unwrap().is_ok());
    }

    impl Drop for Running {
        fn drop(&mut self) {
            let _ = self.stop.send(true);
        }
    }
}
