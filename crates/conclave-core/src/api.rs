use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::errors::ConclaveError;
use crate::events::ConferenceEvent;
use crate::token::Token;

/// Server-side identifier of the negotiated media call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallHandle(pub String);

impl std::fmt::Display for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the participant resource a session acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub participant_id: String,
    pub display_name: Option<String>,
}

impl CallContext {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: None,
        }
    }
}

/// Result of a successful `request_token`.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: Token,
    pub participant_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAnswer {
    pub call: CallHandle,
    pub sdp: String,
}

/// A trickled candidate, completed with the credentials of its media line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSubmission {
    pub candidate: String,
    pub mid: String,
    pub ufrag: String,
    pub pwd: String,
}

/// REST operations against the conferencing node.
#[async_trait]
pub trait ConferenceApi: Send + Sync {
    async fn request_token(
        &self,
        display_name: &str,
        pin: Option<&str>,
    ) -> Result<TokenGrant, ConclaveError>;

    async fn refresh_token(&self, token: &Token) -> Result<Token, ConclaveError>;

    async fn release_token(&self, token: &Token) -> Result<(), ConclaveError>;

    async fn create_call(
        &self,
        context: &CallContext,
        offer: &str,
        presentation_in_mix: bool,
        token: &Token,
    ) -> Result<CallAnswer, ConclaveError>;

    async fn update_call(
        &self,
        context: &CallContext,
        call: &CallHandle,
        offer: &str,
        token: &Token,
    ) -> Result<String, ConclaveError>;

    async fn new_candidate(
        &self,
        context: &CallContext,
        call: &CallHandle,
        candidate: &CandidateSubmission,
        token: &Token,
    ) -> Result<(), ConclaveError>;

    async fn ack_call(
        &self,
        context: &CallContext,
        call: &CallHandle,
        token: &Token,
    ) -> Result<(), ConclaveError>;

    async fn send_message(&self, text: &str, token: &Token) -> Result<(), ConclaveError>;
}

pub type EventStream = BoxStream<'static, Result<ConferenceEvent, ConclaveError>>;

/// Long-lived server push subscription.
///
/// The returned stream ends (or yields an error) when the connection drops;
/// the caller resubscribes.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, token: &Token) -> Result<EventStream, ConclaveError>;
}
