use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Longest token lifetime accepted from a node: one day.
pub const MAX_EXPIRES_IN_SECS: u64 = 24 * 60 * 60;

// Deadline used when `acquired_at + lifetime` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Short-lived credential authorizing REST calls for a session.
///
/// Replaced wholesale on every renewal; never mutated in place.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_in_secs: u64,
    acquired_at: Instant,
}

impl Token {
    /// A token obtained just now.
    pub fn new(value: impl Into<String>, expires_in_secs: u64) -> Self {
        Self::acquired_at(value, expires_in_secs, Instant::now())
    }

    pub fn acquired_at(value: impl Into<String>, expires_in_secs: u64, acquired_at: Instant) -> Self {
        Self {
            value: value.into(),
            expires_in_secs,
            acquired_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_in_secs(&self) -> u64 {
        self.expires_in_secs
    }

    pub fn acquired(&self) -> Instant {
        self.acquired_at
    }

    pub fn is_valid(&self) -> bool {
        self.expires_in_secs > 0 && Instant::now() < self.expires_at()
    }

    pub fn expires_at(&self) -> Instant {
        self.deadline(Duration::from_secs(self.expires_in_secs))
    }

    /// Halfway through the validity window, so one missed renewal still
    /// leaves margin before expiry.
    pub fn renewal_due(&self) -> Instant {
        self.deadline(Duration::from_secs(self.expires_in_secs) / 2)
    }

    fn deadline(&self, after: Duration) -> Instant {
        self.acquired_at
            .checked_add(after)
            .unwrap_or_else(|| self.acquired_at + FAR_FUTURE)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("expires_in_secs", &self.expires_in_secs)
            .finish()
    }
}

/// Holder for the session's current token.
///
/// Backed by a watch channel: reads never block on writers for longer than
/// a clone, and observers can wait for the next renewal.
#[derive(Clone)]
pub struct TokenStore {
    tx: Arc<watch::Sender<Token>>,
}

impl TokenStore {
    pub fn new(token: Token) -> Self {
        let (tx, _rx) = watch::channel(token);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Token {
        self.tx.borrow().clone()
    }

    /// Replace the current token with `f(current)` and return the published value.
    ///
    /// The read-modify-write happens under the channel's write lock, so
    /// concurrent updates are applied one after the other.
    pub fn update_and_get<F>(&self, f: F) -> Token
    where
        F: FnOnce(&Token) -> Token,
    {
        let mut published = None;
        self.tx.send_modify(|current| {
            *current = f(current);
            published = Some(current.clone());
        });
        published.unwrap_or_else(|| self.get())
    }

    /// Subscribe to token replacements.
    pub fn subscribe(&self) -> watch::Receiver<Token> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("token", &*self.tx.borrow())
            .finish()
    }
}
