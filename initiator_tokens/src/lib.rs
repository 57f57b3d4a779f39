//! Facilities for managing the lifecycle of OpenID Connect tokens on behalf of a user
//!
//! This library keeps a set of independently named tokens signed in. Each token name is
//! associated with the connection details of an identity provider. When asked whether a
//! token name is signed in, the [`TokenManager`] works through a chain of strategies,
//! stopping at the first that succeeds:
//!
//! 1. A cached or stored access token that has not yet expired is returned as is.
//! 2. A cached or stored refresh token is exchanged for a new access token without
//!    involving the user.
//! 3. The user is sent to the identity provider in the system browser, and the
//!    authorization response is received on a local redirect listener.
//!
//! Operations against the same token name are serialized, so concurrent callers never
//! trigger duplicate refreshes or open more than one browser window. Different token names
//! proceed independently.
//!
//! Once a token is obtained, the manager can refresh it in the background shortly before it
//! expires. Subscribers are notified of each background refresh.
//!
//! # General Flow (Interactive Sign-in)
//!
//! On application start-up, set up the storage used to persist tokens and the identity
//! provider client, then register the connection details for each token name.
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use initiator_tokens::{
//!     provider::OidcClient, storage::FileTokenStorage, ClientId, IdentityServerConnectionDetails,
//!     OidcClientOptions, TokenManager, TokenManagerConfig, TokenNameRef,
//! };
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = TokenManager::builder(
//!     Arc::new(FileTokenStorage::new(".tokens.json".into())),
//!     Arc::new(OidcClient::default()),
//! )
//! .with_config(TokenManagerConfig::default().with_refresh_lead_time(Duration::from_secs(60)))
//! .build();
//!
//! let options = OidcClientOptions::new(
//!     Url::parse("https://login.example.com/realms/example")?,
//!     ClientId::from_static("desktop-app"),
//!     Url::parse("http://127.0.0.1:7890/callback")?,
//! );
//!
//! manager
//!     .add_server_details("example", IdentityServerConnectionDetails::new(true, options))
//!     .await;
//!
//! # /* Commented out due to this trying to interact with the world.
//! if let Some(token) = manager.check_signin(TokenNameRef::from_str("example")).await? {
//!     tracing::info!(
//!         token = format_args!("{:#?}", token.token()),
//!         "signed in"
//!     );
//! }
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example of signing in and watching for background refreshes in
//! the examples folder. Refer to that example for more details on usage.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oidc`: Provides an implementation of an [`IdentityProvider`][provider::IdentityProvider]
//!   for OpenID Connect authorities supporting the _authorization code_ and _refresh token_
//!   flows.
//! * `file`: Provides an implementation of [`TokenStorage`][storage::TokenStorage] using the
//!   local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod browser;
mod connection;
pub mod listener;
mod manager;
pub mod provider;
pub mod storage;
mod token_data;

pub use braids::*;
pub use connection::{IdentityServerConnectionDetails, OidcClientOptions, Policy, ResponseMode};
pub use manager::{
    SignInError, TokenManager, TokenManagerBuilder, TokenManagerConfig, TokenManagerError,
    TokenRefreshed,
};
pub use token_data::{TokenClaims, TokenData, TokenDataError};
