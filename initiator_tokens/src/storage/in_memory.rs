//! An in-memory token storage

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{StorageError, TokenStorage};
use crate::{
    AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, TokenData, TokenName,
    TokenNameRef,
};

/// Token storage that lives only as long as the process
///
/// Suitable for tests and for applications that are happy to sign in again
/// after a restart.
#[derive(Default, Debug)]
pub struct InMemoryTokenStorage {
    access_tokens: Mutex<HashMap<TokenName, AccessToken>>,
    refresh_tokens: Mutex<HashMap<TokenName, RefreshToken>>,
}

impl InMemoryTokenStorage {
    /// Constructs a new, empty in-memory token storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStorage for InMemoryTokenStorage {
    async fn retrieve_access_token(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<TokenData>, StorageError> {
        let token = self.access_tokens.lock().get(token_name).cloned();
        match token {
            Some(token) => Ok(Some(TokenData::new(token)?)),
            None => Ok(None),
        }
    }

    async fn retrieve_refresh_token(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<RefreshToken>, StorageError> {
        Ok(self
            .refresh_tokens
            .lock()
            .get(token_name)
            .filter(|t| !t.as_str().is_empty())
            .cloned())
    }

    async fn store_access_token(
        &self,
        token_name: &TokenNameRef,
        access_token: &AccessTokenRef,
    ) -> Result<(), StorageError> {
        self.access_tokens
            .lock()
            .insert(token_name.to_owned(), access_token.to_owned());
        Ok(())
    }

    async fn store_refresh_token(
        &self,
        token_name: &TokenNameRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<(), StorageError> {
        self.refresh_tokens
            .lock()
            .insert(token_name.to_owned(), refresh_token.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::{Clock, System};

    use super::*;
    use crate::token_data::test_tokens;

    #[tokio::test]
    async fn stored_tokens_are_returned_by_name() {
        let storage = InMemoryTokenStorage::new();
        let name = TokenNameRef::from_str("api");
        let token = test_tokens::expiring_in(System.now(), 60);

        storage.store_access_token(name, &token).await.unwrap();
        storage
            .store_refresh_token(name, RefreshTokenRef::from_str("refresh"))
            .await
            .unwrap();

        let data = storage.retrieve_access_token(name).await.unwrap().unwrap();
        assert_eq!(data.token(), &*token);
        assert_eq!(
            storage.retrieve_refresh_token(name).await.unwrap().as_deref(),
            Some(RefreshTokenRef::from_str("refresh"))
        );

        let other = TokenNameRef::from_str("other");
        assert!(storage.retrieve_access_token(other).await.unwrap().is_none());
        assert!(storage.retrieve_refresh_token(other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_refresh_token_is_absent() {
        let storage = InMemoryTokenStorage::new();
        let name = TokenNameRef::from_str("api");

        storage
            .store_refresh_token(name, RefreshTokenRef::from_str(""))
            .await
            .unwrap();

        assert!(storage.retrieve_refresh_token(name).await.unwrap().is_none());
    }
}
