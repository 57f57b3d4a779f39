//! Per-name token lifecycle management

use std::{
    collections::HashMap,
    error, fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use aliri_clock::{Clock, System, UnixTime};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};

use crate::{
    browser::{BrowserLauncher, SystemBrowser},
    listener::RedirectListener,
    provider::{IdentityProvider, LoginResult, ProviderError},
    storage::{StorageError, TokenStorage},
    IdentityServerConnectionDetails, RefreshToken, TokenData, TokenDataError, TokenName,
    TokenNameRef,
};

mod refresh;

const DEFAULT_SIGN_IN_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Configuration of a [`TokenManager`]
#[derive(Clone, Debug)]
pub struct TokenManagerConfig {
    refresh_lead_time: Option<Duration>,
    sign_in_timeout: Option<Duration>,
    event_capacity: usize,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_lead_time: None,
            sign_in_timeout: Some(DEFAULT_SIGN_IN_TIMEOUT),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl TokenManagerConfig {
    /// Sets how long before expiration tokens are refreshed in the background
    ///
    /// Without a lead time, background refreshes do not occur.
    #[inline]
    pub fn with_refresh_lead_time(mut self, lead_time: Duration) -> Self {
        self.refresh_lead_time = Some(lead_time);
        self
    }

    /// Sets how long an interactive sign-in may wait for the browser to return
    ///
    /// `None` waits indefinitely.
    #[inline]
    pub fn with_sign_in_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sign_in_timeout = timeout;
        self
    }

    /// Sets how many refresh events are buffered for slow subscribers
    #[inline]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// The background refresh lead time
    #[inline]
    pub fn refresh_lead_time(&self) -> Option<Duration> {
        self.refresh_lead_time
    }

    /// The interactive sign-in timeout
    #[inline]
    pub fn sign_in_timeout(&self) -> Option<Duration> {
        self.sign_in_timeout
    }

    /// The refresh event buffer size
    #[inline]
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }
}

/// Notification that a token was refreshed in the background
#[derive(Clone, Debug)]
pub struct TokenRefreshed {
    /// The name of the refreshed token
    pub token_name: TokenName,
    /// The new token
    pub token: TokenData,
}

/// An error from a [`TokenManager`] operation
#[derive(Debug, Error)]
pub enum TokenManagerError {
    /// No connection details were registered for the token name
    #[error("no identity server connection details registered for token `{0}`")]
    MissingServerDetails(TokenName),
    /// The token storage failed
    #[error("token storage failed")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for TokenManagerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// The reason an interactive sign-in did not produce a token
#[derive(Debug, Error)]
pub enum SignInError {
    /// The redirect listener could not be started or failed while waiting
    #[error("redirect listener failed")]
    Listener(#[source] io::Error),
    /// The browser could not be opened
    #[error("unable to open the browser")]
    Browser(#[source] io::Error),
    /// The identity provider did not issue tokens
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The issued access token could not be read
    #[error("issued access token is unreadable")]
    Token(#[from] TokenDataError),
    /// The browser did not return to the redirect URI in time
    #[error("sign-in was not completed within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Default)]
struct TokenSlot {
    token: Option<TokenData>,
    refresh_token: Option<RefreshToken>,
    /// Set when the slot's lock has been evicted; waiters must look the lock up again
    retired: bool,
}

struct RefreshTimer {
    expiry: UnixTime,
    generation: u64,
    handle: tokio::task::AbortHandle,
}

/// Manages sign-in, refresh, and storage of tokens for a set of token names
///
/// Operations on the same token name are serialized, while different names
/// proceed independently. Cloning produces another handle to the same
/// manager; background refreshes stop once every handle has been dropped.
pub struct TokenManager<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for TokenManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for TokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("server_details", &self.inner.details.read().keys())
            .field("refresh_lead_time", &*self.inner.lead_time.borrow())
            .finish_non_exhaustive()
    }
}

struct Inner<C> {
    storage: Arc<dyn TokenStorage>,
    provider: Arc<dyn IdentityProvider>,
    browser: Arc<dyn BrowserLauncher>,
    clock: C,
    sign_in_timeout: Option<Duration>,
    locks: DashMap<TokenName, Arc<Mutex<TokenSlot>>>,
    details: parking_lot::RwLock<HashMap<TokenName, Arc<IdentityServerConnectionDetails>>>,
    timers: parking_lot::Mutex<HashMap<TokenName, RefreshTimer>>,
    next_generation: AtomicU64,
    lead_time: watch::Sender<Option<Duration>>,
    events: broadcast::Sender<TokenRefreshed>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        for (_, timer) in self.timers.get_mut().drain() {
            timer.handle.abort();
        }
    }
}

/// Builds a [`TokenManager`]
pub struct TokenManagerBuilder<C = System> {
    storage: Arc<dyn TokenStorage>,
    provider: Arc<dyn IdentityProvider>,
    browser: Arc<dyn BrowserLauncher>,
    clock: C,
    config: TokenManagerConfig,
}

impl<C: fmt::Debug> fmt::Debug for TokenManagerBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManagerBuilder")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C> TokenManagerBuilder<C> {
    /// Uses the given launcher to open the browser for interactive sign-in
    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    /// Uses the given clock to judge token expiration
    pub fn with_clock<C2>(self, clock: C2) -> TokenManagerBuilder<C2> {
        TokenManagerBuilder {
            storage: self.storage,
            provider: self.provider,
            browser: self.browser,
            clock,
            config: self.config,
        }
    }

    /// Uses the given configuration
    pub fn with_config(mut self, config: TokenManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the token manager
    pub fn build(self) -> TokenManager<C> {
        let (lead_time, _) = watch::channel(self.config.refresh_lead_time);
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));

        TokenManager {
            inner: Arc::new(Inner {
                storage: self.storage,
                provider: self.provider,
                browser: self.browser,
                clock: self.clock,
                sign_in_timeout: self.config.sign_in_timeout,
                locks: DashMap::new(),
                details: parking_lot::RwLock::new(HashMap::new()),
                timers: parking_lot::Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                lead_time,
                events,
            }),
        }
    }
}

impl TokenManager {
    /// Starts building a token manager over the given storage and identity provider
    pub fn builder(
        storage: Arc<dyn TokenStorage>,
        provider: Arc<dyn IdentityProvider>,
    ) -> TokenManagerBuilder {
        TokenManagerBuilder {
            storage,
            provider,
            browser: Arc::new(SystemBrowser),
            clock: System,
            config: TokenManagerConfig::default(),
        }
    }
}

impl<C> TokenManager<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Registers the connection details used for `token_name`
    ///
    /// Registering details for a name that already has them replaces the
    /// previous details.
    pub async fn add_server_details(
        &self,
        token_name: impl Into<TokenName>,
        details: IdentityServerConnectionDetails,
    ) {
        let token_name = token_name.into();
        let _slot = self.inner.lock_slot(&token_name).await;

        tracing::debug!(token_name = %token_name, authority = %details.authority(), "registering server details");
        self.inner
            .details
            .write()
            .insert(token_name, Arc::new(details));
    }

    /// Removes the connection details for `token_name`
    ///
    /// Any cached tokens and pending background refresh for the name are
    /// discarded. Tokens already persisted to storage are left in place.
    /// Returns whether details were registered.
    pub async fn remove_server_details(&self, token_name: &TokenNameRef) -> bool {
        let Some(mut slot) = self.inner.lock_existing_slot(token_name).await else {
            return false;
        };

        let removed = self.inner.details.write().remove(token_name).is_some();
        if let Some(timer) = self.inner.timers.lock().remove(token_name) {
            timer.handle.abort();
        }
        self.inner.retire(token_name, &mut slot);

        tracing::debug!(token_name = %token_name, removed, "removed server details");
        removed
    }

    /// The token names that have connection details registered
    pub fn server_detail_keys(&self) -> Vec<TokenName> {
        self.inner.details.read().keys().cloned().collect()
    }

    /// Returns a valid access token for `token_name`, signing in if necessary
    ///
    /// A valid cached or stored token is returned as is. Otherwise a refresh
    /// token is used to obtain a new token silently, and failing that the
    /// user is asked to sign in through the browser. Returns `None` if the
    /// user could not be signed in.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection details are registered for
    /// `token_name` or if the token storage fails.
    pub async fn check_signin(
        &self,
        token_name: &TokenNameRef,
    ) -> Result<Option<TokenData>, TokenManagerError> {
        if self.inner.details(token_name).is_none() {
            return Err(TokenManagerError::MissingServerDetails(
                token_name.to_owned(),
            ));
        }

        let mut slot = self.inner.lock_slot(token_name).await;
        let Some(details) = self.inner.details(token_name) else {
            self.inner.retire(token_name, &mut slot);
            return Err(TokenManagerError::MissingServerDetails(
                token_name.to_owned(),
            ));
        };

        let token = self
            .inner
            .acquire_token(token_name, &details, &mut slot)
            .await?;

        if let Some(token) = &token {
            self.inner.schedule_refresh(token_name, token);
        }

        Ok(token)
    }

    /// Sets how long before expiration tokens are refreshed in the background
    ///
    /// Pending background refreshes are rescheduled. If the new lead time
    /// exceeds a token's remaining validity, that token is refreshed
    /// immediately. Token expirations have whole-second precision, so the
    /// lead time is rounded up to the next second.
    pub fn setup_refresh_time_span(&self, lead_time: Duration) {
        tracing::debug!(
            lead_time_secs = lead_time.as_secs(),
            "setting background refresh lead time"
        );
        self.inner.lead_time.send_replace(Some(lead_time));
    }

    /// The current background refresh lead time
    pub fn refresh_time_span(&self) -> Option<Duration> {
        *self.inner.lead_time.borrow()
    }

    /// Subscribes to notifications of background token refreshes
    pub fn subscribe(&self) -> broadcast::Receiver<TokenRefreshed> {
        self.inner.events.subscribe()
    }
}

impl<C> Inner<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn lock_for(&self, token_name: &TokenNameRef) -> Arc<Mutex<TokenSlot>> {
        if let Some(lock) = self.existing_lock(token_name) {
            return lock;
        }

        Arc::clone(
            self.locks
                .entry(token_name.to_owned())
                .or_default()
                .value(),
        )
    }

    fn existing_lock(&self, token_name: &TokenNameRef) -> Option<Arc<Mutex<TokenSlot>>> {
        self.locks.get(token_name).map(|l| Arc::clone(l.value()))
    }

    /// Locks the slot for `token_name`, creating it if necessary
    async fn lock_slot(&self, token_name: &TokenNameRef) -> OwnedMutexGuard<TokenSlot> {
        loop {
            let slot = self.lock_for(token_name).lock_owned().await;
            if !slot.retired {
                return slot;
            }
        }
    }

    async fn lock_existing_slot(
        &self,
        token_name: &TokenNameRef,
    ) -> Option<OwnedMutexGuard<TokenSlot>> {
        loop {
            let slot = self.existing_lock(token_name)?.lock_owned().await;
            if !slot.retired {
                return Some(slot);
            }
        }
    }

    /// Clears the slot and evicts its lock
    ///
    /// Tasks already waiting on the evicted lock observe `retired` and look
    /// the lock up again, so at most one live lock exists per name.
    fn retire(&self, token_name: &TokenNameRef, slot: &mut OwnedMutexGuard<TokenSlot>) {
        **slot = TokenSlot {
            retired: true,
            ..TokenSlot::default()
        };
        let lock = OwnedMutexGuard::mutex(slot);
        self.locks.remove_if(token_name, |_, l| Arc::ptr_eq(l, lock));
    }

    fn details(&self, token_name: &TokenNameRef) -> Option<Arc<IdentityServerConnectionDetails>> {
        self.details.read().get(token_name).cloned()
    }

    async fn acquire_token(
        &self,
        token_name: &TokenNameRef,
        details: &IdentityServerConnectionDetails,
        slot: &mut TokenSlot,
    ) -> Result<Option<TokenData>, TokenManagerError> {
        if let Some(token) = self.valid_token(token_name, slot).await? {
            return Ok(Some(token));
        }

        if let Some(token) = self.silent_refresh(token_name, details, slot).await? {
            return Ok(Some(token));
        }

        match self.interactive_sign_in(details).await {
            Ok((login, token)) => {
                if let Some(refresh_token) = &login.refresh_token {
                    self.storage
                        .store_refresh_token(token_name, refresh_token)
                        .await?;
                }
                self.storage
                    .store_access_token(token_name, token.token())
                    .await?;

                tracing::info!(token_name = %token_name, "interactive sign-in succeeded");
                slot.refresh_token = login.refresh_token;
                slot.token = Some(token.clone());
                Ok(Some(token))
            }
            Err(error) => {
                tracing::error!(
                    token_name = %token_name,
                    error = (&error as &dyn error::Error),
                    "interactive sign-in failed"
                );
                Ok(None)
            }
        }
    }

    async fn valid_token(
        &self,
        token_name: &TokenNameRef,
        slot: &mut TokenSlot,
    ) -> Result<Option<TokenData>, StorageError> {
        if slot.token.is_none() {
            tracing::trace!(token_name = %token_name, "no cached access token, checking storage");
            slot.token = self.storage.retrieve_access_token(token_name).await?;
        }

        match &slot.token {
            Some(token) if !token.is_expired_with_clock(&self.clock) => {
                tracing::trace!(token_name = %token_name, "access token still valid");
                Ok(Some(token.clone()))
            }
            Some(token) => {
                tracing::debug!(
                    token_name = %token_name,
                    expired_at = token.expiration_date().0,
                    "access token expired"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Attempts a refresh without user interaction
    ///
    /// Provider failures are logged and reported as `None`.
    async fn silent_refresh(
        &self,
        token_name: &TokenNameRef,
        details: &IdentityServerConnectionDetails,
        slot: &mut TokenSlot,
    ) -> Result<Option<TokenData>, StorageError> {
        if slot.refresh_token.is_none() {
            slot.refresh_token = self.storage.retrieve_refresh_token(token_name).await?;
        }

        let Some(refresh_token) = slot.refresh_token.clone() else {
            tracing::debug!(token_name = %token_name, "no refresh token available");
            return Ok(None);
        };

        let result = match self
            .provider
            .refresh_token(details.options(), &refresh_token)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(
                    token_name = %token_name,
                    error = (&error as &dyn error::Error),
                    "unable to refresh access token"
                );
                return Ok(None);
            }
        };

        let token = match TokenData::new(result.access_token) {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(
                    token_name = %token_name,
                    error = (&error as &dyn error::Error),
                    "refreshed access token is unreadable"
                );
                return Ok(None);
            }
        };

        if details.replace_refresh_token() {
            if let Some(new_refresh_token) = result.refresh_token {
                self.storage
                    .store_refresh_token(token_name, &new_refresh_token)
                    .await?;
                slot.refresh_token = Some(new_refresh_token);
            }
        }

        self.storage
            .store_access_token(token_name, token.token())
            .await?;
        slot.token = Some(token.clone());

        tracing::debug!(
            token_name = %token_name,
            expiration = token.expiration_date().0,
            "refreshed access token"
        );

        Ok(Some(token))
    }

    async fn interactive_sign_in(
        &self,
        details: &IdentityServerConnectionDetails,
    ) -> Result<(LoginResult, TokenData), SignInError> {
        let options = details.options();

        let listener = RedirectListener::bind(options.redirect_uri())
            .await
            .map_err(SignInError::Listener)?;
        let state = self.provider.prepare_login(options).await?;

        self.browser
            .open(&state.start_url)
            .map_err(SignInError::Browser)?;

        let callback = listener.receive_callback(details.login_html());
        let payload = match self.sign_in_timeout {
            Some(timeout) => tokio::time::timeout(timeout, callback)
                .await
                .map_err(|_| SignInError::TimedOut(timeout))?,
            None => callback.await,
        }
        .map_err(SignInError::Listener)?;
        drop(listener);

        let login = self
            .provider
            .process_login_response(options, &payload, &state)
            .await?;
        let token = TokenData::new(login.access_token.clone())?;

        Ok((login, token))
    }

    fn schedule_refresh(self: &Arc<Self>, token_name: &TokenNameRef, token: &TokenData) {
        let expiry = token.expiration_date();
        let mut timers = self.timers.lock();

        if let Some(timer) = timers.get(token_name) {
            if timer.expiry == expiry && !timer.handle.is_finished() {
                return;
            }
            timer.handle.abort();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(refresh::auto_refresh(
            Arc::downgrade(self),
            token_name.to_owned(),
            expiry,
            generation,
            self.lead_time.subscribe(),
            self.clock.clone(),
        ));

        tracing::trace!(token_name = %token_name, expiry = expiry.0, "scheduled background refresh");
        timers.insert(
            token_name.to_owned(),
            RefreshTimer {
                expiry,
                generation,
                handle: task.abort_handle(),
            },
        );
    }
}
