//! DTOs for interacting with OpenID Connect identity providers

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{AccessToken, ClientIdRef, ClientSecretRef, IdToken, RefreshToken, RefreshTokenRef};

/// The subset of the discovery document used by the client
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderMetadata {
    /// The issuer identifier
    pub issuer: String,
    /// The authorization endpoint
    pub authorization_endpoint: Url,
    /// The token endpoint
    pub token_endpoint: Url,
    /// The JWKS endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<Url>,
    /// The end session endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<Url>,
}

#[derive(Debug, Serialize)]
pub(super) struct AuthorizationCodeGrant<'a> {
    pub grant_type: &'static str,
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub client_id: &'a ClientIdRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<&'a ClientSecretRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(super) struct RefreshTokenGrant<'a> {
    pub grant_type: &'static str,
    pub refresh_token: &'a RefreshTokenRef,
    pub client_id: &'a ClientIdRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<&'a ClientSecretRef>,
    pub scope: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub id_token: Option<IdToken>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Parameters delivered to the redirect URI
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct AuthorizationResponse {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationResponse {
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim().trim_start_matches('?');
        let mut response = Self::default();
        for (key, value) in url::form_urlencoded::parse(payload.as_bytes()) {
            match key.as_ref() {
                "code" => response.code = Some(value.into_owned()),
                "state" => response.state = Some(value.into_owned()),
                "error" => response.error = Some(value.into_owned()),
                "error_description" => response.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        response
    }
}
