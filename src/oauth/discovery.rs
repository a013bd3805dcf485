// Authorization Server Metadata Discovery (RFC 8414)

use super::OAuthError;
use serde::{Deserialize, Serialize};
use url::Url;

const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct RawMetadata {
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    registration_endpoint: Option<String>,
}

/// Origin-root well-known URL first, then the path-scoped one.
pub fn candidate_urls(server_url: &str) -> Result<Vec<String>, OAuthError> {
    let url = Url::parse(server_url)
        .map_err(|e| OAuthError::Discovery(format!("{}: {}", server_url, e)))?;
    if !url.has_host() {
        return Err(OAuthError::Discovery(format!("{}: no host", server_url)));
    }

    let origin = url.origin().ascii_serialization();
    let mut candidates = vec![format!("{}{}", origin, WELL_KNOWN_PATH)];

    let path = url.path().trim_end_matches('/');
    if !path.is_empty() {
        candidates.push(format!("{}{}{}", origin, WELL_KNOWN_PATH, path));
    }
    Ok(candidates)
}

/// `Ok(None)` when no candidate answered with usable metadata.
pub async fn discover(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<Option<OAuthMetadata>, OAuthError> {
    for candidate in candidate_urls(server_url)? {
        match fetch_candidate(http, &candidate).await {
            Some(metadata) => {
                tracing::debug!(url = %candidate, "discovered OAuth metadata");
                return Ok(Some(metadata));
            }
            None => tracing::debug!(url = %candidate, "no usable OAuth metadata"),
        }
    }
    Ok(None)
}

async fn fetch_candidate(http: &reqwest::Client, url: &str) -> Option<OAuthMetadata> {
    let response = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }

    let raw: RawMetadata = response.json().await.ok()?;
    Some(OAuthMetadata {
        authorization_endpoint: raw.authorization_endpoint?,
        token_endpoint: raw.token_endpoint?,
        registration_endpoint: raw.registration_endpoint,
    })
}
