//! An identity provider client for OpenID Connect authorities

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use url::Url;

use super::{AuthorizeState, IdentityProvider, LoginResult, ProviderError, RefreshResult};
use crate::{OidcClientOptions, RefreshTokenRef, ResponseMode};

pub mod dto;

use dto::{AuthorizationResponse, ProviderMetadata};

const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// An OpenID Connect client for the authorization code flow
///
/// Discovery documents are fetched once per authority and reused for the
/// lifetime of the client.
#[derive(Debug)]
pub struct OidcClient {
    client: reqwest::Client,
    discovery: RwLock<HashMap<Url, Arc<ProviderMetadata>>>,
}

impl Default for OidcClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl OidcClient {
    /// Constructs a new client using the provided HTTP client
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(HashMap::new()),
        }
    }

    /// Uses the provided metadata for `authority` instead of fetching its discovery document
    pub async fn with_metadata(self, authority: Url, metadata: ProviderMetadata) -> Self {
        self.discovery
            .write()
            .await
            .insert(authority, Arc::new(metadata));
        self
    }

    async fn metadata(&self, authority: &Url) -> Result<Arc<ProviderMetadata>, ProviderError> {
        if let Some(metadata) = self.discovery.read().await.get(authority) {
            return Ok(Arc::clone(metadata));
        }

        let metadata = Arc::new(self.fetch_metadata(authority).await?);
        self.discovery
            .write()
            .await
            .insert(authority.clone(), Arc::clone(&metadata));
        Ok(metadata)
    }

    #[tracing::instrument(err, skip_all, fields(authority = %authority))]
    async fn fetch_metadata(&self, authority: &Url) -> Result<ProviderMetadata, ProviderError> {
        let uri = discovery_url(authority)?;

        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| ProviderError::Discovery(e.into()))?;
        response
            .error_for_status_ref()
            .map_err(|e| ProviderError::Discovery(e.into()))?;

        let metadata = response
            .json::<ProviderMetadata>()
            .await
            .map_err(|e| ProviderError::Discovery(e.into()))?;

        tracing::debug!(issuer = %metadata.issuer, "fetched discovery document");

        Ok(metadata)
    }

    #[tracing::instrument(err, skip_all, fields(token_url = %token_url, grant_type = grant_type))]
    async fn request_tokens<F: serde::Serialize>(
        &self,
        token_url: Url,
        grant_type: &'static str,
        form: &F,
    ) -> Result<dto::TokenResponse, ProviderError> {
        tracing::trace!("requesting tokens from identity provider");

        let resp = self
            .client
            .post(token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.into()))?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received token response from identity provider"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp
                .text()
                .await
                .map_err(|e| ProviderError::Body(e.into()))?;
            return Err(error_from_body(&body).unwrap_or_else(|| {
                tracing::debug!(body = %body, "token error response was not an OAuth2 error");
                ProviderError::Transport(error.into())
            }));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::Body(e.into()))?;
        let tokens: dto::TokenResponse =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Body(e.into()))?;

        tracing::info!(
            has_id_token = tokens.id_token.is_some(),
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_in = tokens.expires_in,
            "received new tokens"
        );

        Ok(tokens)
    }
}

#[async_trait]
impl IdentityProvider for OidcClient {
    async fn prepare_login(
        &self,
        options: &OidcClientOptions,
    ) -> Result<AuthorizeState, ProviderError> {
        let metadata = self.metadata(options.authority()).await?;

        let state = random_value();
        let nonce = random_value();
        let code_verifier = options.policy().use_pkce().then(random_value);
        let challenge = code_verifier.as_deref().map(pkce_challenge);

        let start_url = authorize_url(
            &metadata.authorization_endpoint,
            options,
            &state,
            &nonce,
            challenge.as_deref(),
        );

        Ok(AuthorizeState {
            start_url,
            state,
            nonce,
            code_verifier,
            redirect_uri: options.redirect_uri().clone(),
        })
    }

    async fn process_login_response(
        &self,
        options: &OidcClientOptions,
        payload: &str,
        state: &AuthorizeState,
    ) -> Result<LoginResult, ProviderError> {
        let response = AuthorizationResponse::parse(payload);

        if let Some(error) = response.error {
            return Err(ProviderError::Rejected {
                error,
                description: response.error_description,
            });
        }

        if response.state.as_deref() != Some(state.state.as_str()) {
            return Err(ProviderError::StateMismatch);
        }

        let code = response.code.ok_or(ProviderError::MissingCode)?;

        let metadata = self.metadata(options.authority()).await?;
        let grant = dto::AuthorizationCodeGrant {
            grant_type: "authorization_code",
            code: &code,
            redirect_uri: state.redirect_uri.as_str(),
            client_id: options.client_id(),
            client_secret: options.client_secret(),
            code_verifier: state.code_verifier.as_deref(),
        };

        let tokens = self
            .request_tokens(metadata.token_endpoint.clone(), grant.grant_type, &grant)
            .await?;

        Ok(LoginResult {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id_token: tokens.id_token,
        })
    }

    async fn refresh_token(
        &self,
        options: &OidcClientOptions,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshResult, ProviderError> {
        let metadata = self.metadata(options.authority()).await?;
        let grant = dto::RefreshTokenGrant {
            grant_type: "refresh_token",
            refresh_token,
            client_id: options.client_id(),
            client_secret: options.client_secret(),
            scope: options.scope(),
        };

        let tokens = self
            .request_tokens(metadata.token_endpoint.clone(), grant.grant_type, &grant)
            .await?;

        Ok(RefreshResult {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        })
    }
}

fn discovery_url(authority: &Url) -> Result<Url, ProviderError> {
    let base = format!("{}/", authority.as_str().trim_end_matches('/'));
    Url::parse(&base)
        .and_then(|b| b.join(DISCOVERY_PATH))
        .map_err(|e| ProviderError::Discovery(e.into()))
}

fn authorize_url(
    endpoint: &Url,
    options: &OidcClientOptions,
    state: &str,
    nonce: &str,
    code_challenge: Option<&str>,
) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", options.client_id().as_str())
            .append_pair("redirect_uri", options.redirect_uri().as_str())
            .append_pair("scope", options.scope())
            .append_pair("state", state)
            .append_pair("nonce", nonce);

        if let Some(challenge) = code_challenge {
            query
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", "S256");
        }

        if options.policy().response_mode() != ResponseMode::Query {
            query.append_pair("response_mode", options.policy().response_mode().as_str());
        }
    }
    url
}

fn error_from_body(body: &str) -> Option<ProviderError> {
    serde_json::from_str::<dto::ErrorResponse>(body)
        .ok()
        .map(|e| ProviderError::Rejected {
            error: e.error,
            description: e.error_description,
        })
}

fn random_value() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn pkce_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, Policy};

    fn options() -> OidcClientOptions {
        OidcClientOptions::new(
            Url::parse("http://localhost:8888/realms/test").unwrap(),
            ClientId::from_static("Tests"),
            Url::parse("http://127.0.0.1:9999/callback").unwrap(),
        )
    }

    fn metadata() -> ProviderMetadata {
        ProviderMetadata {
            issuer: "http://localhost:8888/realms/test".to_owned(),
            authorization_endpoint: Url::parse("http://localhost:8888/auth").unwrap(),
            token_endpoint: Url::parse("http://localhost:8888/token").unwrap(),
            jwks_uri: None,
            end_session_endpoint: None,
        }
    }

    async fn client() -> OidcClient {
        OidcClient::default()
            .with_metadata(options().authority().clone(), metadata())
            .await
    }

    fn login_state() -> AuthorizeState {
        AuthorizeState {
            start_url: Url::parse("http://localhost:8888/auth").unwrap(),
            state: "expected".to_owned(),
            nonce: "nonce".to_owned(),
            code_verifier: None,
            redirect_uri: options().redirect_uri().clone(),
        }
    }

    #[test]
    fn discovery_url_keeps_the_authority_path() {
        let with_slash = Url::parse("https://idp.example.com/realms/test/").unwrap();
        let without_slash = Url::parse("https://idp.example.com/realms/test").unwrap();
        let expected = "https://idp.example.com/realms/test/.well-known/openid-configuration";

        assert_eq!(discovery_url(&with_slash).unwrap().as_str(), expected);
        assert_eq!(discovery_url(&without_slash).unwrap().as_str(), expected);
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_example() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn random_values_are_unique() {
        let first = random_value();
        assert_eq!(first.len(), 43);
        assert_ne!(first, random_value());
    }

    #[test]
    fn oauth_error_bodies_are_rejections() {
        let error = error_from_body(r#"{"error":"invalid_grant","error_description":"expired"}"#);
        assert!(matches!(
            error,
            Some(ProviderError::Rejected { ref error, ref description })
                if error == "invalid_grant" && description.as_deref() == Some("expired")
        ));
        assert!(error_from_body("<html>oops</html>").is_none());
    }

    #[tokio::test]
    async fn login_url_carries_the_request_parameters() {
        let state = client().await.prepare_login(&options()).await.unwrap();

        let params: HashMap<_, _> = state.start_url.query_pairs().into_owned().collect();
        assert_eq!(state.start_url.path(), "/auth");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "Tests");
        assert_eq!(params["redirect_uri"], "http://127.0.0.1:9999/callback");
        assert_eq!(params["state"], state.state);
        assert_eq!(params["nonce"], state.nonce);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(
            params["code_challenge"],
            pkce_challenge(state.code_verifier.as_deref().unwrap())
        );
        assert!(!params.contains_key("response_mode"));
    }

    #[tokio::test]
    async fn pkce_and_response_mode_follow_the_policy() {
        let options = options().with_policy(
            Policy::default()
                .with_pkce(false)
                .with_response_mode(ResponseMode::FormPost),
        );
        let state = client().await.prepare_login(&options).await.unwrap();

        let params: HashMap<_, _> = state.start_url.query_pairs().into_owned().collect();
        assert!(state.code_verifier.is_none());
        assert!(!params.contains_key("code_challenge"));
        assert_eq!(params["response_mode"], "form_post");
    }

    #[tokio::test]
    async fn error_in_callback_is_a_rejection() {
        let result = client()
            .await
            .process_login_response(
                &options(),
                "?error=access_denied&error_description=User%20cancelled&state=expected",
                &login_state(),
            )
            .await;

        assert!(matches!(
            result,
            Err(ProviderError::Rejected { ref error, ref description })
                if error == "access_denied" && description.as_deref() == Some("User cancelled")
        ));
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_refused() {
        let result = client()
            .await
            .process_login_response(&options(), "code=abc&state=forged", &login_state())
            .await;

        assert!(matches!(result, Err(ProviderError::StateMismatch)));
    }

    #[tokio::test]
    async fn callback_without_code_is_refused() {
        let result = client()
            .await
            .process_login_response(&options(), "state=expected", &login_state())
            .await;

        assert!(matches!(result, Err(ProviderError::MissingCode)));
    }

    #[test]
    fn callback_payload_parses_query_and_form_bodies() {
        let expected = AuthorizationResponse {
            code: Some("abc".to_owned()),
            state: Some("xyz".to_owned()),
            ..AuthorizationResponse::default()
        };

        assert_eq!(AuthorizationResponse::parse("?code=abc&state=xyz"), expected);
        assert_eq!(AuthorizationResponse::parse("code=abc&state=xyz\r\n"), expected);
    }
}
