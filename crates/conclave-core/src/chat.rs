use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::api::{CallContext, ConferenceApi};
use crate::errors::ConclaveError;
use crate::event_bus::EventSender;
use crate::events::{ChatMessage, ConferenceEvent};
use crate::token::TokenStore;

const TEXT_PLAIN: &str = "text/plain";

/// Sends conference chat messages on behalf of the local participant.
pub struct ChatService {
    api: Arc<dyn ConferenceApi>,
    store: TokenStore,
    events: EventSender,
    sender_id: String,
    sender_name: String,
}

impl ChatService {
    pub fn new(
        api: Arc<dyn ConferenceApi>,
        store: TokenStore,
        events: EventSender,
        context: &CallContext,
    ) -> Self {
        Self {
            api,
            store,
            events,
            sender_id: context.participant_id.clone(),
            sender_name: context.display_name.clone().unwrap_or_default(),
        }
    }

    /// Post a plain-text message to everyone in the conference.
    ///
    /// On success a `MessageSent` event carrying the message is emitted.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, ConclaveError> {
        if text.trim().is_empty() {
            return Err(ConclaveError::EmptyMessage);
        }

        self.api.send_message(text, &self.store.get()).await?;

        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            mime_type: TEXT_PLAIN.to_string(),
            text: text.to_string(),
            timestamp_ms: u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default(),
        };
        debug!(target: "conclave.chat", id = %msg.id, "message sent");
        self.events.emit(ConferenceEvent::MessageSent(msg.clone()));

        Ok(msg)
    }
}
