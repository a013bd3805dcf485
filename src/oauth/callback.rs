// Local OAuth Callback Server
//
// Claims the first free port in a range by actually binding it, then answers
// exactly one path. The first callback resolves the flow; the page rendered
// tells the user whether to go back to the app.

use super::{OAuthError, CALLBACK_HOST, CALLBACK_PATH};

use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub type CallbackResult = Result<String, OAuthError>;

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<String>,
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>,
}

/// Stops serving when dropped.
pub struct CallbackServer {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CallbackServer {
    pub async fn start(
        ports: RangeInclusive<u16>,
        expected_state: String,
    ) -> Result<(Self, oneshot::Receiver<CallbackResult>), OAuthError> {
        let listener = bind_first_free(ports).await?;
        let port = listener
            .local_addr()
            .map_err(|source| OAuthError::CallbackBind { port: 0, source })?
            .port();

        let (code_tx, code_rx) = oneshot::channel();
        let state = CallbackState {
            expected_state: Arc::new(expected_state),
            sender: Arc::new(Mutex::new(Some(code_tx))),
        };
        let app = Router::new()
            .route(CALLBACK_PATH, get(callback_handler))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::warn!(port, error = %e, "callback server error");
            }
            tracing::debug!(port, "callback server stopped");
        });

        tracing::info!(port, "OAuth callback server listening");
        Ok((
            Self {
                port,
                shutdown: Some(shutdown_tx),
            },
            code_rx,
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}:{}{}", CALLBACK_HOST, self.port, CALLBACK_PATH)
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Real bind on each port in turn. Only "address in use" moves on to the next one.
pub async fn bind_first_free(ports: RangeInclusive<u16>) -> Result<TcpListener, OAuthError> {
    let (start, end) = (*ports.start(), *ports.end());
    let host = IpAddr::V4(Ipv4Addr::LOCALHOST);

    for port in ports {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                tracing::debug!(port, "callback port in use, trying next");
            }
            Err(source) => return Err(OAuthError::CallbackBind { port, source }),
        }
    }
    Err(OAuthError::PortsExhausted { start, end })
}

/// State mismatch, then provider error, then missing code.
pub fn evaluate(params: &CallbackParams, expected_state: &str) -> CallbackResult {
    if params.state.as_deref() != Some(expected_state) {
        return Err(OAuthError::StateMismatch);
    }
    if let Some(error) = &params.error {
        return Err(OAuthError::Provider {
            error: error.clone(),
            description: params.error_description.clone(),
        });
    }
    match &params.code {
        Some(code) if !code.is_empty() => Ok(code.clone()),
        _ => Err(OAuthError::MissingCode),
    }
}

async fn callback_handler(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    let outcome = evaluate(&params, &state.expected_state);
    let page = match &outcome {
        Ok(_) => success_page(),
        Err(OAuthError::StateMismatch) => failure_page(
            "Security Error",
            "The authorization response did not match this request. Please try again from the app.",
        ),
        Err(e) => failure_page("Authorization Failed", &e.to_string()),
    };

    let sender = match state.sender.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    match sender {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => tracing::debug!("ignoring repeated OAuth callback"),
    }

    Html(page)
}

fn success_page() -> String {
    render_page(
        "Authorization Successful",
        "You can close this window and return to the app.",
    )
}

fn failure_page(title: &str, message: &str) -> String {
    render_page(title, message)
}

fn render_page(title: &str, message: &str) -> String {
    let title = escape_html(title);
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; padding: 48px;">
<h1>{title}</h1>
<p>{}</p>
</body>
</html>"#,
        escape_html(message)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
