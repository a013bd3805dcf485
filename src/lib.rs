// Toolgate - Main Library
//
// Captures the intent an agent attaches to each tool call. Tool schemas sent
// to the provider gain `_intent`/`_displayName` fields; the streamed answer is
// cleaned of them and the values are kept per tool_use id for other processes.

pub mod api_error;
pub mod config;
pub mod interceptor;
pub mod logging;
pub mod metadata;
pub mod oauth;
pub mod proxy;
pub mod rewriter;
pub mod sse;

pub use api_error::{ApiErrorStore, LastApiError};
pub use config::{BaseUrl, GatewayConfig};
pub use interceptor::Interceptor;
pub use metadata::{MetadataStore, ToolMetadata};

use std::sync::Arc;
use tokio::sync::watch;

/// Runs the local gateway until Ctrl-C.
pub async fn run() -> std::io::Result<()> {
    let config = GatewayConfig::from_env();
    logging::init_logging(&config);

    let interceptor = Arc::new(Interceptor::from_config(&config));
    if let Some(dir) = interceptor.store().session_directory() {
        tracing::info!(dir = %dir.display(), "recording tool metadata for session");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    proxy::start_proxy_server(&config, interceptor, shutdown_rx).await
}
