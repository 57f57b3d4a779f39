//! Token storage

use std::error;

use async_trait::async_trait;

use crate::{AccessTokenRef, RefreshToken, RefreshTokenRef, TokenData, TokenNameRef};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileTokenStorage;
pub use in_memory::InMemoryTokenStorage;

/// An error raised by a token storage implementation
pub type StorageError = Box<dyn error::Error + Send + Sync + 'static>;

/// Durable storage for access and refresh tokens, keyed by token name
///
/// Tokens grant access to the user's account as if they were the user, so
/// implementations should encrypt tokens at rest, for example with an
/// account-bound key or the operating system keychain.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Retrieves the access token stored under `token_name`, if any
    async fn retrieve_access_token(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<TokenData>, StorageError>;

    /// Retrieves the refresh token stored under `token_name`, if any
    ///
    /// An empty stored refresh token is reported as `None`.
    async fn retrieve_refresh_token(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<RefreshToken>, StorageError>;

    /// Stores an access token under `token_name`, replacing any prior token
    async fn store_access_token(
        &self,
        token_name: &TokenNameRef,
        access_token: &AccessTokenRef,
    ) -> Result<(), StorageError>;

    /// Stores a refresh token under `token_name`, replacing any prior token
    async fn store_refresh_token(
        &self,
        token_name: &TokenNameRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<(), StorageError>;
}
