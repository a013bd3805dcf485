// Client Registration and Token Grants

use super::OAuthError;
use serde::{Deserialize, Serialize};

/// Public-client registration answer, or the fixed fallback client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl OAuthClient {
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthTokens {
    /// Tokens without an expiry never expire.
    pub fn is_expired(&self, now_ms: i64, skew_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ms.saturating_add(skew_ms) >= expires_at,
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, now_ms: i64) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| now_ms.saturating_add(secs.saturating_mul(1000))),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: self.scope,
        }
    }
}

pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    client_name: &str,
    redirect_uri: &str,
) -> Result<OAuthClient, OAuthError> {
    let body = serde_json::json!({
        "client_name": client_name,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    let response = http
        .post(registration_endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| OAuthError::Registration(e.to_string()))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(OAuthError::Registration(format!("HTTP {}: {}", status.as_u16(), text)));
    }
    serde_json::from_str(&text)
        .map_err(|e| OAuthError::Registration(format!("invalid registration response: {}", e)))
}

pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &OAuthClient,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<OAuthTokens, OAuthError> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client.client_id.as_str()),
        ("code_verifier", code_verifier),
    ];
    if let Some(secret) = &client.client_secret {
        form.push(("client_secret", secret.as_str()));
    }

    let response = post_form(http, token_endpoint, &form)
        .await
        .map_err(OAuthError::TokenExchange)?;
    serde_json::from_str::<TokenResponse>(&response)
        .map(|r| r.into_tokens(chrono::Utc::now().timestamp_millis()))
        .map_err(|e| OAuthError::TokenExchange(format!("invalid token response: {}", e)))
}

/// A missing `refresh_token` in the answer keeps the one that was sent.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &OAuthClient,
    refresh_token: &str,
) -> Result<OAuthTokens, OAuthError> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client.client_id.as_str()),
    ];
    if let Some(secret) = &client.client_secret {
        form.push(("client_secret", secret.as_str()));
    }

    let response = post_form(http, token_endpoint, &form)
        .await
        .map_err(OAuthError::TokenRefresh)?;
    let mut tokens = serde_json::from_str::<TokenResponse>(&response)
        .map(|r| r.into_tokens(chrono::Utc::now().timestamp_millis()))
        .map_err(|e| OAuthError::TokenRefresh(format!("invalid token response: {}", e)))?;

    if tokens.refresh_token.is_none() {
        tokens.refresh_token = Some(refresh_token.to_string());
    }
    Ok(tokens)
}

/// Body text on success, `HTTP <status>: <body>` otherwise.
async fn post_form(
    http: &reqwest::Client,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<String, String> {
    let response = http
        .post(endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    let text = response.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("HTTP {}: {}", status.as_u16(), text));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn expiry_respects_skew() {
        let tokens = OAuthTokens {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: Some(100_000),
            token_type: "Bearer".to_string(),
            scope: None,
        };
        assert!(!tokens.is_expired(30_000, 60_000));
        assert!(tokens.is_expired(40_000, 60_000));

        let forever = OAuthTokens {
            expires_at: None,
            ..tokens
        };
        assert!(!forever.is_expired(i64::MAX / 2, 60_000));
    }

    #[tokio::test]
    async fn code_exchange_posts_form_with_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=verif"))
            .and(body_string_contains("client_id=toolgate-desktop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at_1",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "rt_1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let before = chrono::Utc::now().timestamp_millis();
        let tokens = exchange_code(
            &reqwest::Client::new(),
            &format!("{}/token", server.uri()),
            &OAuthClient::public("toolgate-desktop"),
            "the-code",
            "http://127.0.0.1:19876/oauth/callback",
            "verif",
        )
        .await
        .unwrap();

        assert_eq!(tokens.access_token, "at_1");
        assert_eq!(tokens.token_type, "bearer");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt_1"));
        assert!(tokens.expires_at.unwrap() >= before + 3_600_000);
    }

    #[tokio::test]
    async fn absurd_expires_in_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a",
                "token_type": "Bearer",
                "expires_in": 9_223_372_036_854_775i64
            })))
            .mount(&server)
            .await;

        let tokens = exchange_code(
            &reqwest::Client::new(),
            &format!("{}/token", server.uri()),
            &OAuthClient::public("c"),
            "code",
            "http://127.0.0.1/cb",
            "v",
        )
        .await
        .unwrap();

        assert_eq!(tokens.expires_at, Some(i64::MAX));
        assert!(!tokens.is_expired(chrono::Utc::now().timestamp_millis(), 60_000));
        assert!(tokens.is_expired(i64::MAX - 1, i64::MAX));
    }

    #[tokio::test]
    async fn provider_error_carries_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let err = exchange_code(
            &reqwest::Client::new(),
            &format!("{}/token", server.uri()),
            &OAuthClient::public("c"),
            "code",
            "http://127.0.0.1/cb",
            "v",
        )
        .await
        .unwrap_err();

        match err {
            OAuthError::TokenExchange(message) => {
                assert!(message.contains("400"));
                assert!(message.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_when_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt_old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at_2",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let tokens = refresh_tokens(
            &reqwest::Client::new(),
            &format!("{}/token", server.uri()),
            &OAuthClient::public("c"),
            "rt_old",
        )
        .await
        .unwrap();

        assert_eq!(tokens.access_token, "at_2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt_old"));
        assert_eq!(tokens.expires_at, None);
    }

    #[tokio::test]
    async fn registration_sends_redirect_uri_and_parses_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(body_string_contains("http://127.0.0.1:19877/oauth/callback"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "client_id": "dyn_123",
                "client_id_issued_at": 1
            })))
            .mount(&server)
            .await;

        let client = register_client(
            &reqwest::Client::new(),
            &format!("{}/register", server.uri()),
            "Toolgate",
            "http://127.0.0.1:19877/oauth/callback",
        )
        .await
        .unwrap();
        assert_eq!(client, OAuthClient::public("dyn_123"));
    }
}
