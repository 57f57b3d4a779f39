use std::{error, sync::Weak, time::Duration};

use aliri_clock::{Clock, UnixTime};
use tokio::sync::watch;

use super::{Inner, TokenRefreshed};
use crate::{TokenData, TokenName, TokenNameRef};

/// The longest the timer sleeps before re-checking the clock
///
/// Timers do not advance while the host is suspended.
const HEARTBEAT: Duration = Duration::from_secs(30);

pub(super) async fn auto_refresh<C>(
    inner: Weak<Inner<C>>,
    token_name: TokenName,
    mut expiry: UnixTime,
    generation: u64,
    mut lead_time: watch::Receiver<Option<Duration>>,
    clock: C,
) where
    C: Clock + Clone + Send + Sync + 'static,
{
    loop {
        if wait_until_due(&clock, expiry, &mut lead_time).await.is_err() {
            tracing::trace!(token_name = %token_name, "token manager dropped, halting refreshes");
            return;
        }

        let Some(manager) = inner.upgrade() else {
            tracing::trace!(token_name = %token_name, "token manager dropped, halting refreshes");
            return;
        };

        match manager.timer_refresh(&token_name, generation).await {
            Some(token) => {
                expiry = token.expiration_date();
                tracing::debug!(
                    token_name = %token_name,
                    expiry = expiry.0,
                    "waiting for refreshed token to near expiration"
                );
            }
            None => return,
        }
    }
}

async fn wait_until_due<C: Clock>(
    clock: &C,
    expiry: UnixTime,
    lead_time: &mut watch::Receiver<Option<Duration>>,
) -> Result<(), watch::error::RecvError> {
    loop {
        let current = *lead_time.borrow_and_update();
        let Some(lead) = current else {
            lead_time.changed().await?;
            continue;
        };

        let due = UnixTime(expiry.0.saturating_sub(whole_seconds(lead)));
        let now = clock.now();
        if now >= due {
            tracing::trace!("token due for refresh");
            return Ok(());
        }

        let until_due = Duration::from_secs(due.0 - now.0);
        let delay = until_due.min(HEARTBEAT);
        tracing::trace!(
            delay = delay.as_secs(),
            until_due = until_due.as_secs(),
            "token not yet due for refresh, sleeping…"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = lead_time.changed() => changed?,
        }
    }
}

fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl<C> Inner<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Refreshes a token on behalf of the background timer
    ///
    /// Returns `None` when the timer should stop.
    async fn timer_refresh(&self, token_name: &TokenNameRef, generation: u64) -> Option<TokenData> {
        let mut slot = self.lock_existing_slot(token_name).await?;

        if !self.owns_timer(token_name, generation) {
            return None;
        }
        let details = self.details(token_name)?;

        tracing::debug!(token_name = %token_name, "refreshing token in the background");
        match self.silent_refresh(token_name, &details, &mut slot).await {
            Ok(Some(token)) => {
                if let Some(timer) = self.timers.lock().get_mut(token_name) {
                    timer.expiry = token.expiration_date();
                }

                let event = TokenRefreshed {
                    token_name: token_name.to_owned(),
                    token: token.clone(),
                };
                if self.events.send(event).is_err() {
                    tracing::trace!(token_name = %token_name, "no subscribers for refresh events");
                }

                Some(token)
            }
            Ok(None) => {
                tracing::warn!(
                    token_name = %token_name,
                    "Attempting to refresh access token failed. No further auto-refreshes will occur"
                );
                self.release_timer(token_name, generation);
                None
            }
            Err(error) => {
                tracing::warn!(
                    token_name = %token_name,
                    error = (&*error as &dyn error::Error),
                    "Attempting to refresh access token failed. No further auto-refreshes will occur"
                );
                self.release_timer(token_name, generation);
                None
            }
        }
    }

    fn owns_timer(&self, token_name: &TokenNameRef, generation: u64) -> bool {
        self.timers
            .lock()
            .get(token_name)
            .map_or(false, |t| t.generation == generation)
    }

    fn release_timer(&self, token_name: &TokenNameRef, generation: u64) {
        let mut timers = self.timers.lock();
        if timers.get(token_name).map_or(false, |t| t.generation == generation) {
            timers.remove(token_name);
        }
    }
}
