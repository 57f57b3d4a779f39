//! Identity provider connection details

use url::Url;

use crate::{ClientId, ClientIdRef, ClientSecret, ClientSecretRef};

const DEFAULT_SCOPE: &str = "openid profile offline_access";

const DEFAULT_LOGIN_HTML: &str = "<html><body>Please return to the app.</body></html>";

/// How the identity provider should return the authorization response
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Parameters are appended to the redirect URI's query string
    #[default]
    Query,
    /// Parameters are posted to the redirect URI as a form body
    FormPost,
}

impl ResponseMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::FormPost => "form_post",
        }
    }
}

/// Protocol policy applied when talking to the identity provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    use_pkce: bool,
    response_mode: ResponseMode,
}

impl Default for Policy {
    /// Default policy
    ///
    /// Uses PKCE with an S256 challenge and receives the authorization
    /// response in the query string.
    fn default() -> Self {
        Self {
            use_pkce: true,
            response_mode: ResponseMode::Query,
        }
    }
}

impl Policy {
    /// Sets whether a PKCE challenge accompanies the authorization request
    pub fn with_pkce(mut self, use_pkce: bool) -> Self {
        self.use_pkce = use_pkce;
        self
    }

    /// Sets how the authorization response is returned
    pub fn with_response_mode(mut self, response_mode: ResponseMode) -> Self {
        self.response_mode = response_mode;
        self
    }

    /// Whether PKCE is used
    #[inline]
    pub fn use_pkce(&self) -> bool {
        self.use_pkce
    }

    /// The response mode requested
    #[inline]
    pub fn response_mode(&self) -> ResponseMode {
        self.response_mode
    }
}

/// Options used to authenticate the client to the identity provider
#[derive(Clone, Debug)]
pub struct OidcClientOptions {
    authority: Url,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
    redirect_uri: Url,
    scope: String,
    policy: Policy,
}

impl OidcClientOptions {
    /// Constructs options for a public client
    ///
    /// `redirect_uri` must be a loopback address that the local redirect
    /// listener can bind to.
    pub fn new(authority: Url, client_id: ClientId, redirect_uri: Url) -> Self {
        Self {
            authority,
            client_id,
            client_secret: None,
            redirect_uri,
            scope: DEFAULT_SCOPE.to_owned(),
            policy: Policy::default(),
        }
    }

    /// Sets the client secret for confidential clients
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Sets the requested scopes, separated by spaces
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the protocol policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Url where the identity provider can be reached
    #[inline]
    pub fn authority(&self) -> &Url {
        &self.authority
    }

    /// The client ID
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The client secret, if any
    #[inline]
    pub fn client_secret(&self) -> Option<&ClientSecretRef> {
        self.client_secret.as_deref()
    }

    /// The URI the browser is redirected to after authenticating
    #[inline]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// The requested scopes
    #[inline]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The protocol policy
    #[inline]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// Everything needed to refresh or sign in to a token for one token name
#[derive(Clone, Debug)]
pub struct IdentityServerConnectionDetails {
    options: OidcClientOptions,
    replace_refresh_token: bool,
    login_html: Option<String>,
}

impl IdentityServerConnectionDetails {
    /// Constructs connection details
    ///
    /// `replace_refresh_token` indicates that the identity provider issues a new
    /// refresh token whenever the refresh endpoint is called.
    pub fn new(replace_refresh_token: bool, options: OidcClientOptions) -> Self {
        Self {
            options,
            replace_refresh_token,
            login_html: None,
        }
    }

    /// Sets the page shown in the browser once sign-in completes
    pub fn with_login_html(mut self, html: impl Into<String>) -> Self {
        self.login_html = Some(html.into());
        self
    }

    /// Url where the identity provider can be reached
    #[inline]
    pub fn authority(&self) -> &Url {
        self.options.authority()
    }

    /// Options used to authenticate the client
    #[inline]
    pub fn options(&self) -> &OidcClientOptions {
        &self.options
    }

    /// Whether the refresh token rotates on every refresh
    #[inline]
    pub fn replace_refresh_token(&self) -> bool {
        self.replace_refresh_token
    }

    /// The page shown in the browser once sign-in completes
    pub fn login_html(&self) -> &str {
        self.login_html.as_deref().unwrap_or(DEFAULT_LOGIN_HTML)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> OidcClientOptions {
        OidcClientOptions::new(
            Url::parse("http://localhost:8888/").unwrap(),
            ClientId::from_static("Tests"),
            Url::parse("http://127.0.0.1:9999/").unwrap(),
        )
    }

    #[test]
    fn login_html_falls_back_to_default() {
        let details = IdentityServerConnectionDetails::new(false, options());
        assert_eq!(details.login_html(), DEFAULT_LOGIN_HTML);

        let details = details.with_login_html("<p>done</p>");
        assert_eq!(details.login_html(), "<p>done</p>");
    }

    #[test]
    fn defaults_request_offline_access_with_pkce() {
        let options = options();
        assert!(options.scope().contains("offline_access"));
        assert!(options.policy().use_pkce());
        assert_eq!(options.policy().response_mode(), ResponseMode::Query);
        assert!(options.client_secret().is_none());
    }

    #[test]
    fn authority_comes_from_options() {
        let details = IdentityServerConnectionDetails::new(true, options());
        assert_eq!(details.authority().as_str(), "http://localhost:8888/");
        assert!(details.replace_refresh_token());
    }
}
