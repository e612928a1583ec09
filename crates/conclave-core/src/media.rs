use async_trait::async_trait;

use crate::errors::ConclaveError;
use crate::sdp::{MidRoles, SessionDescription, StableMediaId};

/// Local media engine, seen only through its negotiation surface.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Generate a local offer without applying it.
    async fn create_offer(&self) -> Result<SessionDescription, ConclaveError>;

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), ConclaveError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), ConclaveError>;

    /// Which mid each role's transceiver currently uses.
    fn mid_roles(&self) -> MidRoles;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from the media engine, consumed in order by the
/// negotiation controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    NegotiationNeeded,
    IceCandidate { candidate: String, mid: String },
    IceConnectionStateChanged(IceConnectionState),
    LocalTrackAdded(StableMediaId),
    LocalTrackRemoved(StableMediaId),
    RemoteTrackAdded(StableMediaId),
    RemoteTrackRemoved(StableMediaId),
}
