use crate::errors::ConclaveError;
use crate::sdp::StableMediaId;

/// Events delivered to listeners, in arrival order.
///
/// Remote events come from the node's push stream; the rest are
/// synthesized by the session itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceEvent {
    PresentationStart {
        presenter_name: String,
        presenter_uri: String,
    },
    PresentationStop,
    MessageReceived(ChatMessage),
    Disconnect { reason: String },
    Bye,
    IncomingCall {
        conference_alias: String,
        remote_display_name: String,
        token: String,
    },
    IncomingCancelled { token: String },
    CameraControl(FeccCommand),
    ParticipantJoined(ParticipantInfo),
    ParticipantUpdated(ParticipantInfo),
    ParticipantLeft(String), // participant id

    // Local
    MessageSent(ChatMessage),
    TokenRefreshFailed(ConclaveError),
    EventStreamReconnecting { attempt: u32 },
    MediaConnectionChanged(MediaConnectionState),
    LocalTrackChanged { role: StableMediaId, active: bool },
    RemoteTrackChanged { role: StableMediaId, active: bool },
}

impl ConferenceEvent {
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConferenceEvent::MessageSent(_)
                | ConferenceEvent::TokenRefreshFailed(_)
                | ConferenceEvent::EventStreamReconnecting { .. }
                | ConferenceEvent::MediaConnectionChanged(_)
                | ConferenceEvent::LocalTrackChanged { .. }
                | ConferenceEvent::RemoteTrackChanged { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: String,
    pub display_name: String,
    pub uri: Option<String>,
    pub is_muted: bool,
    pub is_presenting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub mime_type: String,
    pub text: String,
    pub timestamp_ms: u64,
}

/// Far-end camera control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeccCommand {
    pub action: FeccAction,
    pub movements: Vec<FeccMovement>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeccAction {
    Start,
    Continue,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeccMovement {
    pub axis: String,
    pub direction: String,
}

/// Trait for receiving events from the session.
/// Called from the event bus task, one event at a time.
pub trait ConferenceEventListener: Send + Sync {
    fn on_event(&self, event: ConferenceEvent);
}
