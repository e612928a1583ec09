//! Background renewal and release of the session token.
//!
//! The manager moves through `Idle -> Scheduled -> Disposed`. While
//! scheduled, a task sleeps until half of the current token's validity has
//! elapsed, refreshes it (retrying transient failures per the injected
//! [`RetryPolicy`]) and publishes the result to the [`TokenStore`].

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ConferenceApi;
use crate::errors::ConclaveError;
use crate::retry::RetryPolicy;
use crate::token::{Token, TokenStore};

/// Invoked once per unrecoverable renewal failure.
pub type FailureCallback = Arc<dyn Fn(ConclaveError) + Send + Sync>;

enum LifecycleState {
    Idle,
    Scheduled(JoinHandle<()>),
    Disposed,
}

pub struct TokenLifecycleManager {
    api: Arc<dyn ConferenceApi>,
    store: TokenStore,
    policy: RetryPolicy,
    on_failure: FailureCallback,
    cancel: CancellationToken,
    state: Mutex<LifecycleState>,
}

impl TokenLifecycleManager {
    pub fn new(
        api: Arc<dyn ConferenceApi>,
        store: TokenStore,
        policy: RetryPolicy,
        cancel: CancellationToken,
        on_failure: FailureCallback,
    ) -> Self {
        Self {
            api,
            store,
            policy,
            on_failure,
            cancel,
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    /// Schedule the first renewal. No-op unless idle.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, LifecycleState::Idle) {
            return;
        }

        let token = self.store.get();
        info!(
            target: "conclave.lifecycle",
            expires_in_secs = token.expires_in_secs(),
            "scheduling token renewal"
        );
        let handle = tokio::spawn(renewal_loop(
            self.api.clone(),
            self.store.clone(),
            self.policy,
            self.cancel.clone(),
            self.on_failure.clone(),
        ));
        *state = LifecycleState::Scheduled(handle);
    }

    pub fn is_scheduled(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*state, LifecycleState::Scheduled(_))
    }

    pub fn is_disposed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*state, LifecycleState::Disposed)
    }

    /// Cancel any pending renewal and release the token.
    ///
    /// Release failures are logged and dropped. Only the first call does
    /// anything.
    pub async fn dispose(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, LifecycleState::Disposed)
        };
        let handle = match previous {
            LifecycleState::Disposed => return,
            LifecycleState::Idle => None,
            LifecycleState::Scheduled(handle) => Some(handle),
        };

        self.cancel.cancel();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(target: "conclave.lifecycle", error = %e, "renewal task ended abnormally");
            }
        }

        let token = self.store.get();
        match self.api.release_token(&token).await {
            Ok(()) => info!(target: "conclave.lifecycle", "token released"),
            Err(e) => debug!(
                target: "conclave.lifecycle",
                error = %e,
                "token release failed, ignoring"
            ),
        }
    }
}

async fn renewal_loop(
    api: Arc<dyn ConferenceApi>,
    store: TokenStore,
    policy: RetryPolicy,
    cancel: CancellationToken,
    on_failure: FailureCallback,
) {
    loop {
        let due = store.get().renewal_due();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(due) => {}
        }

        let refreshed = tokio::select! {
            _ = cancel.cancelled() => return,
            result = refresh_with_retry(api.as_ref(), &store, &policy) => result,
        };

        match refreshed {
            Ok(token) if token.expires_in_secs() == 0 => {
                let e = ConclaveError::Protocol("refreshed token has no lifetime".into());
                warn!(target: "conclave.lifecycle", error = %e, "token renewal gave up");
                on_failure(e);
                return;
            }
            Ok(token) => {
                let token = store.update_and_get(|_| token);
                debug!(
                    target: "conclave.lifecycle",
                    expires_in_secs = token.expires_in_secs(),
                    "token refreshed"
                );
            }
            Err(e) => {
                warn!(target: "conclave.lifecycle", error = %e, "token renewal gave up");
                on_failure(e);
                return;
            }
        }
    }
}

async fn refresh_with_retry(
    api: &dyn ConferenceApi,
    store: &TokenStore,
    policy: &RetryPolicy,
) -> Result<Token, ConclaveError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get();
        match api.refresh_token(&current).await {
            Ok(token) => return Ok(token),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    target: "conclave.lifecycle",
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "token refresh failed, will retry"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
