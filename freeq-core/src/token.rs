//! Bearer-token fetch and scheduled refresh.
//!
//! Tokens are fetched after registration when a [`TokenIssuer`] and a
//! password are available, then refreshed `token_refresh_margin` before
//! expiry by a background task holding only a weak session reference.
//!
//! [`TokenIssuer`]: crate::host::TokenIssuer

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::host::BearerToken;
use crate::session::{ConnectionSession, SessionInner};

/// Never refresh sooner than this, even for tokens already near expiry.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Handle to the pending refresh task, if any.
#[derive(Debug, Default)]
pub(crate) struct TokenRefresher {
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TokenRefresher {
    /// Replace the pending refresh with `task`.
    pub fn arm(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// How long to wait before refreshing `token`; `None` when it never expires.
pub(crate) fn refresh_delay(token: &BearerToken, margin: Duration) -> Option<Duration> {
    let expires_at = token.expires_at?;
    let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
    Some(remaining.saturating_sub(margin).max(MIN_REFRESH_DELAY))
}

/// Fetch a token and publish it. Failures are logged and leave any previous
/// token in place.
async fn fetch(inner: &SessionInner) -> Option<BearerToken> {
    let issuer = inner.services.token_issuer.clone()?;
    let credentials = inner.credentials.lock().clone()?;
    let password = credentials.password.as_deref()?;
    match issuer
        .fetch_token(&inner.config.server_url, credentials.sasl_account(), password)
        .await
    {
        Ok(token) => {
            tracing::info!(expires_at = ?token.expires_at, "Bearer token refreshed");
            *inner.token.lock() = Some(token.clone());
            inner.host.on_token_refreshed(&token);
            Some(token)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Bearer token fetch failed");
            None
        }
    }
}

async fn refresh_loop(session: Weak<SessionInner>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = session.upgrade() else {
            return;
        };
        let Some(token) = fetch(&inner).await else {
            return;
        };
        let Some(next) = refresh_delay(&token, inner.config.token_refresh_margin()) else {
            return;
        };
        delay = next;
    }
}

impl ConnectionSession {
    /// Fetch a bearer token now and schedule its refresh.
    pub(crate) async fn refresh_token(&self) {
        let Some(token) = fetch(&self.inner).await else {
            return;
        };
        self.schedule_refresh(&token);
    }

    fn schedule_refresh(&self, token: &BearerToken) {
        if self.is_closed() {
            return;
        }
        let Some(delay) = refresh_delay(token, self.inner.config.token_refresh_margin()) else {
            self.inner.refresher.cancel();
            return;
        };
        tracing::debug!(?delay, "Scheduling token refresh");
        let task = tokio::spawn(refresh_loop(Arc::downgrade(&self.inner), delay));
        self.inner.refresher.arm(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in: Option<chrono::Duration>) -> BearerToken {
        BearerToken {
            token: "t".into(),
            expires_at: expires_in.map(|d| Utc::now() + d),
        }
    }

    #[test]
    fn delay_subtracts_margin() {
        let delay = refresh_delay(
            &token(Some(chrono::Duration::hours(1))),
            Duration::from_secs(300),
        )
        .unwrap();
        assert!(delay > Duration::from_secs(3200) && delay <= Duration::from_secs(3300));
    }

    #[test]
    fn delay_is_clamped_and_optional() {
        let soon = token(Some(chrono::Duration::seconds(10)));
        assert_eq!(
            refresh_delay(&soon, Duration::from_secs(300)),
            Some(MIN_REFRESH_DELAY)
        );
        let expired = token(Some(chrono::Duration::seconds(-10)));
        assert_eq!(
            refresh_delay(&expired, Duration::from_secs(300)),
            Some(MIN_REFRESH_DELAY)
        );
        assert_eq!(refresh_delay(&token(None), Duration::from_secs(300)), None);
    }

    #[tokio::test]
    async fn arming_replaces_previous_task() {
        let refresher = TokenRefresher::default();
        refresher.arm(tokio::spawn(std::future::pending::<()>()));
        assert!(refresher.is_armed());
        refresher.arm(tokio::spawn(std::future::pending::<()>()));
        assert!(refresher.is_armed());
        refresher.cancel();
        assert!(!refresher.is_armed());
    }
}
