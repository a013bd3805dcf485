// OAuth Flow Controller
//
// Authorization-code + PKCE against a discovered authorization server:
// discovery, callback bind, optional dynamic registration, browser hand-off,
// code wait, token exchange. Progress is reported on an event stream.

pub mod callback;
pub mod discovery;
pub mod pkce;
pub mod tokens;

pub use callback::CallbackServer;
pub use discovery::OAuthMetadata;
pub use pkce::PkcePair;
pub use tokens::{OAuthClient, OAuthTokens};

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

pub const CALLBACK_PORT_START: u16 = 19876;
pub const CALLBACK_PORT_END: u16 = 19885;
pub const CALLBACK_HOST: &str = "127.0.0.1";
pub const CALLBACK_PATH: &str = "/oauth/callback";
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CLIENT_ID: &str = "toolgate-desktop";
pub const DEFAULT_CLIENT_NAME: &str = "Toolgate";
/// Refresh this long before the advertised expiry.
pub const EXPIRY_SKEW_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("no OAuth authorization server metadata found for {0}")]
    MetadataNotFound(String),
    #[error("invalid OAuth server URL {0}")]
    Discovery(String),
    #[error("client registration failed: {0}")]
    Registration(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("no free callback port between {start} and {end}")]
    PortsExhausted { start: u16, end: u16 },
    #[error("failed to bind callback server on port {port}: {source}")]
    CallbackBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0} seconds waiting for authorization")]
    Timeout(u64),
    #[error("state parameter mismatch, the callback did not come from this request")]
    StateMismatch,
    #[error("authorization server returned {error}{}", describe(.description))]
    Provider {
        error: String,
        description: Option<String>,
    },
    #[error("callback did not include an authorization code")]
    MissingCode,
    #[error("authorization was cancelled")]
    Cancelled,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn describe(description: &Option<String>) -> String {
    match description {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    MetadataFetched,
    CallbackServerBound,
    ClientRegistered,
    DefaultClient,
    BrowserOpened,
    CodeReceived,
    TokensExchanged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthEvent {
    Status { state: FlowState, message: String },
    /// The browser could not be launched; the user has to open `url` themselves.
    OpenManually { url: String },
    Failed { message: String },
}

pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

#[derive(Debug, Clone)]
pub struct OAuthFlowConfig {
    pub server_url: String,
    pub client_name: String,
    pub default_client_id: String,
    pub callback_ports: RangeInclusive<u16>,
    pub timeout: Duration,
    pub scope: Option<String>,
}

impl OAuthFlowConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            default_client_id: DEFAULT_CLIENT_ID.to_string(),
            callback_ports: CALLBACK_PORT_START..=CALLBACK_PORT_END,
            timeout: FLOW_TIMEOUT,
            scope: None,
        }
    }
}

/// What a successful flow hands back. Persisting it is the caller's business.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub metadata: OAuthMetadata,
    pub client: OAuthClient,
    pub tokens: OAuthTokens,
}

pub struct OAuthFlow {
    config: OAuthFlowConfig,
    http: reqwest::Client,
    browser: Arc<dyn BrowserOpener>,
    events: mpsc::UnboundedSender<OAuthEvent>,
    callback: Mutex<Option<CallbackServer>>,
    cancelled: watch::Sender<bool>,
}

impl OAuthFlow {
    pub fn new(config: OAuthFlowConfig) -> (Self, UnboundedReceiverStream<OAuthEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (cancelled, _) = watch::channel(false);
        let flow = Self {
            config,
            http: reqwest::Client::new(),
            browser: Arc::new(SystemBrowser),
            events,
            callback: Mutex::new(None),
            cancelled,
        };
        (flow, UnboundedReceiverStream::new(rx))
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserOpener>) -> Self {
        self.browser = browser;
        self
    }

    /// Preliminary probe: no discoverable metadata means no OAuth.
    pub async fn is_auth_required(&self) -> bool {
        matches!(
            discovery::discover(&self.http, &self.config.server_url).await,
            Ok(Some(_))
        )
    }

    pub async fn authenticate(&self) -> Result<Authorization, OAuthError> {
        self.cancelled.send_replace(false);

        let result = self.run().await;
        self.close_callback_server();

        if let Err(e) = &result {
            tracing::warn!(server = %self.config.server_url, error = %e, "OAuth flow failed");
            self.status(FlowState::Failed, format!("Authorization failed: {}", e));
            self.emit(OAuthEvent::Failed {
                message: e.to_string(),
            });
        }
        result
    }

    pub async fn refresh(
        &self,
        metadata: &OAuthMetadata,
        client: &OAuthClient,
        refresh_token: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        tokens::refresh_tokens(&self.http, &metadata.token_endpoint, client, refresh_token).await
    }

    /// Stops waiting for the browser. An exchange already in flight still completes.
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
        self.close_callback_server();
    }

    async fn run(&self) -> Result<Authorization, OAuthError> {
        self.status(FlowState::Idle, "Discovering authorization server...".to_string());
        let metadata = discovery::discover(&self.http, &self.config.server_url)
            .await?
            .ok_or_else(|| OAuthError::MetadataNotFound(self.config.server_url.clone()))?;
        self.status(
            FlowState::MetadataFetched,
            format!("Found authorization server at {}", metadata.authorization_endpoint),
        );

        let pkce = PkcePair::generate();
        let state = pkce::state_token();

        // Bound before registration: the redirect URI must carry the real port.
        let (server, code_rx) =
            CallbackServer::start(self.config.callback_ports.clone(), state.clone()).await?;
        let redirect_uri = server.redirect_uri();
        self.status(
            FlowState::CallbackServerBound,
            format!("Listening for the authorization callback on port {}", server.port()),
        );
        self.set_callback_server(server);

        let client = match &metadata.registration_endpoint {
            Some(endpoint) => {
                self.status(
                    FlowState::CallbackServerBound,
                    "Registering client...".to_string(),
                );
                let client = tokens::register_client(
                    &self.http,
                    endpoint,
                    &self.config.client_name,
                    &redirect_uri,
                )
                .await
                .inspect_err(|_| self.close_callback_server())?;
                self.status(
                    FlowState::ClientRegistered,
                    format!("Registered client {}", client.client_id),
                );
                client
            }
            None => {
                self.status(
                    FlowState::DefaultClient,
                    "Using the default public client".to_string(),
                );
                OAuthClient::public(self.config.default_client_id.clone())
            }
        };

        let auth_url = authorization_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            &redirect_uri,
            &pkce.challenge,
            &state,
            self.config.scope.as_deref(),
        )?;

        match self.browser.open(&auth_url) {
            Ok(()) => self.status(
                FlowState::BrowserOpened,
                "Waiting for you to approve access in the browser...".to_string(),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open browser");
                self.emit(OAuthEvent::OpenManually {
                    url: auth_url.clone(),
                });
                self.status(
                    FlowState::BrowserOpened,
                    "Open the authorization link in your browser to continue".to_string(),
                );
            }
        }

        let code = self.wait_for_code(code_rx).await?;
        self.close_callback_server();
        self.status(FlowState::CodeReceived, "Exchanging authorization code...".to_string());

        let tokens = tokens::exchange_code(
            &self.http,
            &metadata.token_endpoint,
            &client,
            &code,
            &redirect_uri,
            &pkce.verifier,
        )
        .await?;
        self.status(FlowState::TokensExchanged, "Authorization complete".to_string());

        Ok(Authorization {
            metadata,
            client,
            tokens,
        })
    }

    async fn wait_for_code(
        &self,
        code_rx: tokio::sync::oneshot::Receiver<callback::CallbackResult>,
    ) -> Result<String, OAuthError> {
        let mut cancelled = self.cancelled.subscribe();
        let cancel_requested = async move {
            let _ = cancelled.wait_for(|c| *c).await;
        };

        tokio::select! {
            outcome = code_rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(OAuthError::Cancelled),
            },
            _ = cancel_requested => Err(OAuthError::Cancelled),
            _ = tokio::time::sleep(self.config.timeout) => {
                Err(OAuthError::Timeout(self.config.timeout.as_secs()))
            }
        }
    }

    fn set_callback_server(&self, server: CallbackServer) {
        let mut slot = self.callback.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(server);
    }

    fn close_callback_server(&self) {
        let server = self.callback.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(server);
    }

    fn status(&self, state: FlowState, message: String) {
        tracing::debug!(?state, %message, "OAuth flow");
        self.emit(OAuthEvent::Status { state, message });
    }

    fn emit(&self, event: OAuthEvent) {
        let _ = self.events.send(event);
    }
}

pub fn authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    code_challenge: &str,
    state: &str,
    scope: Option<&str>,
) -> Result<String, OAuthError> {
    let mut url = Url::parse(authorization_endpoint)
        .map_err(|e| OAuthError::Discovery(format!("{}: {}", authorization_endpoint, e)))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        if let Some(scope) = scope {
            query.append_pair("scope", scope);
        }
    }
    Ok(url.to_string())
}
