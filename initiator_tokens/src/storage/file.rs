//! A file-backed token storage

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, sync::RwLock};

use super::{StorageError, TokenStorage};
use crate::{
    AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, TokenData, TokenName,
    TokenNameRef,
};

/// Token storage that persists tokens to a JSON document on the local filesystem
///
/// On Unix, the file is created readable and writable by the owner only. The
/// tokens themselves are _not_ encrypted.
///
/// Updates are written to a sibling temporary file which then replaces the
/// document, so readers never observe a partially written document.
#[derive(Debug)]
pub struct FileTokenStorage {
    path: PathBuf,
    file_lock: RwLock<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(default)]
    tokens: BTreeMap<TokenName, StoredEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<AccessToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
}

impl FileTokenStorage {
    /// Constructs a new file token storage
    ///
    /// The file is created on the first write.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file_lock: RwLock::new(()),
        }
    }

    async fn read_tokens(&self) -> Result<StoredTokens, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StoredTokens::default())
            }
            Err(err) => return Err(err),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        let tokens = serde_json::from_str(&data)?;
        Ok(tokens)
    }

    async fn write_tokens(&self, tokens: &StoredTokens) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        let data = serde_json::to_string_pretty(tokens)?;
        let staging = staging_path(&self.path);

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&staging).await?;
        file.write_all(data.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }
        Ok(())
    }

    async fn update(
        &self,
        token_name: &TokenNameRef,
        apply: impl FnOnce(&mut StoredEntry),
    ) -> Result<(), io::Error> {
        let _guard = self.file_lock.write().await;
        let mut tokens = self.read_tokens().await?;
        apply(tokens.tokens.entry(token_name.to_owned()).or_default());
        self.write_tokens(&tokens).await
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| OsString::from("tokens"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl TokenStorage for FileTokenStorage {
    async fn retrieve_access_token(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<TokenData>, StorageError> {
        let mut tokens = {
            let _guard = self.file_lock.read().await;
            self.read_tokens().await?
        };
        match tokens
            .tokens
            .remove(token_name)
            .and_then(|e| e.access_token)
        {
            Some(token) => Ok(Some(TokenData::new(token)?)),
            None => Ok(None),
        }
    }

    async fn retrieve_refresh_token(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<RefreshToken>, StorageError> {
        let mut tokens = {
            let _guard = self.file_lock.read().await;
            self.read_tokens().await?
        };
        Ok(tokens
            .tokens
            .remove(token_name)
            .and_then(|e| e.refresh_token)
            .filter(|t| !t.as_str().is_empty()))
    }

    async fn store_access_token(
        &self,
        token_name: &TokenNameRef,
        access_token: &AccessTokenRef,
    ) -> Result<(), StorageError> {
        let access_token = access_token.to_owned();
        Ok(self
            .update(token_name, |entry| entry.access_token = Some(access_token))
            .await?)
    }

    async fn store_refresh_token(
        &self,
        token_name: &TokenNameRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<(), StorageError> {
        let refresh_token = refresh_token.to_owned();
        Ok(self
            .update(token_name, |entry| entry.refresh_token = Some(refresh_token))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use aliri_clock::{Clock, System};

    use super::*;
    use crate::token_data::test_tokens;

    fn temp_path(test: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "initiator-tokens-{}-{}.json",
            test,
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn missing_file_has_no_tokens() {
        let storage = FileTokenStorage::new(temp_path("missing"));
        let name = TokenNameRef::from_str("api");

        assert!(storage.retrieve_access_token(name).await.unwrap().is_none());
        assert!(storage.retrieve_refresh_token(name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_survive_a_new_storage_instance() {
        let path = temp_path("survive");
        let name = TokenNameRef::from_str("api");
        let token = test_tokens::expiring_in(System.now(), 60);

        {
            let storage = FileTokenStorage::new(path.clone());
            storage.store_access_token(name, &token).await.unwrap();
            storage
                .store_refresh_token(name, RefreshTokenRef::from_str("refresh"))
                .await
                .unwrap();
        }

        let storage = FileTokenStorage::new(path.clone());
        let data = storage.retrieve_access_token(name).await.unwrap().unwrap();
        assert_eq!(data.token(), &*token);
        assert_eq!(
            storage.retrieve_refresh_token(name).await.unwrap().as_deref(),
            Some(RefreshTokenRef::from_str("refresh"))
        );

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn storing_one_token_keeps_the_other() {
        let path = temp_path("keep");
        let storage = FileTokenStorage::new(path.clone());
        let first = TokenNameRef::from_str("first");
        let second = TokenNameRef::from_str("second");

        storage
            .store_refresh_token(first, RefreshTokenRef::from_str("one"))
            .await
            .unwrap();
        storage
            .store_refresh_token(second, RefreshTokenRef::from_str("two"))
            .await
            .unwrap();

        assert_eq!(
            storage.retrieve_refresh_token(first).await.unwrap().as_deref(),
            Some(RefreshTokenRef::from_str("one"))
        );

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_are_consistent_while_another_name_is_written() {
        let path = temp_path("concurrent");
        let storage = Arc::new(FileTokenStorage::new(path.clone()));
        let reader = TokenNameRef::from_str("b");
        storage
            .store_refresh_token(reader, RefreshTokenRef::from_str("steady"))
            .await
            .unwrap();

        let writer = tokio::spawn({
            let storage = Arc::clone(&storage);
            async move {
                for i in 0..200 {
                    let token = RefreshToken::new(format!("rotated-{i}"));
                    storage
                        .store_refresh_token(TokenNameRef::from_str("a"), &token)
                        .await
                        .unwrap();
                }
            }
        });

        while !writer.is_finished() {
            assert_eq!(
                storage.retrieve_refresh_token(reader).await.unwrap().as_deref(),
                Some(RefreshTokenRef::from_str("steady"))
            );
        }
        writer.await.unwrap();

        assert_eq!(
            storage
                .retrieve_refresh_token(TokenNameRef::from_str("a"))
                .await
                .unwrap()
                .as_deref(),
            Some(RefreshTokenRef::from_str("rotated-199"))
        );
        assert!(!staging_path(&path).exists());

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn document_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("private");
        let storage = FileTokenStorage::new(path.clone());
        storage
            .store_refresh_token(
                TokenNameRef::from_str("api"),
                RefreshTokenRef::from_str("secret"),
            )
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
