//! Identity providers

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::{AccessToken, IdToken, OidcClientOptions, RefreshToken, RefreshTokenRef};

#[cfg(feature = "oidc")]
pub mod oidc;

#[cfg(feature = "oidc")]
pub use oidc::OidcClient;

/// State carried from preparing a login to processing its response
#[derive(Clone, Debug)]
pub struct AuthorizeState {
    /// The URL the browser should be sent to
    pub start_url: Url,
    /// The anti-forgery state value expected back from the identity provider
    pub state: String,
    /// The nonce sent along with the authorization request
    pub nonce: String,
    /// The PKCE code verifier, if PKCE is in use
    pub code_verifier: Option<String>,
    /// The redirect URI the authorization request was issued for
    pub redirect_uri: Url,
}

/// Tokens issued at the end of a successful interactive login
#[derive(Clone, Debug)]
pub struct LoginResult {
    /// The new access token
    pub access_token: AccessToken,
    /// The new refresh token, if one was issued
    pub refresh_token: Option<RefreshToken>,
    /// The ID token, if one was issued
    pub id_token: Option<IdToken>,
}

/// Tokens issued by a successful refresh
#[derive(Clone, Debug)]
pub struct RefreshResult {
    /// The new access token
    pub access_token: AccessToken,
    /// A replacement refresh token, if the provider rotates refresh tokens
    pub refresh_token: Option<RefreshToken>,
}

/// An error reported by, or while talking to, an identity provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The identity provider rejected the request
    #[error("identity provider rejected the request: {error}")]
    Rejected {
        /// The OAuth2 error code
        error: String,
        /// A human readable description, if provided
        description: Option<String>,
    },
    /// The state returned with the authorization response did not match
    #[error("authorization response state does not match the login request")]
    StateMismatch,
    /// The authorization response did not contain an authorization code
    #[error("authorization response does not contain an authorization code")]
    MissingCode,
    /// The identity provider's discovery document could not be obtained
    #[error("unable to obtain the identity provider's discovery document")]
    Discovery(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// A request to the identity provider could not be completed
    #[error("error communicating with the identity provider")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The identity provider's response could not be understood
    #[error("unable to understand the identity provider's response")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A client of an OpenID Connect identity provider
///
/// Protocol details such as PKCE, nonces, and response modes are selected by
/// the [`OidcClientOptions`] passed on each call, as different token names
/// may use different identity providers.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Prepares an interactive login, producing the URL to send the browser to
    async fn prepare_login(
        &self,
        options: &OidcClientOptions,
    ) -> Result<AuthorizeState, ProviderError>;

    /// Exchanges the payload delivered to the redirect URI for tokens
    ///
    /// `payload` is the URL-encoded set of parameters delivered to the
    /// redirect URI, either as a query string or as a form body.
    async fn process_login_response(
        &self,
        options: &OidcClientOptions,
        payload: &str,
        state: &AuthorizeState,
    ) -> Result<LoginResult, ProviderError>;

    /// Uses a refresh token to obtain a new access token
    async fn refresh_token(
        &self,
        options: &OidcClientOptions,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshResult, ProviderError>;
}
