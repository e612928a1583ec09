//! Drives offer/answer and candidate trickling for one media session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::ConclaveError;
use crate::event_bus::EventSender;
use crate::events::{ConferenceEvent, MediaConnectionState};
use crate::media::{IceConnectionState, MediaEvent, MediaSession};
use crate::sdp::{Mangled, SessionDescription, mangle};
use crate::signaling::SignalingChannel;

impl From<IceConnectionState> for MediaConnectionState {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New | IceConnectionState::Checking => {
                MediaConnectionState::Connecting
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                MediaConnectionState::Connected
            }
            IceConnectionState::Disconnected | IceConnectionState::Closed => {
                MediaConnectionState::Disconnected
            }
            IceConnectionState::Failed => MediaConnectionState::Failed,
        }
    }
}

/// Owns a media session and keeps the node's call resource in step with it.
///
/// Media events are handled one at a time. Failures never escape: they are
/// logged and the controller carries on with the next event.
pub struct NegotiationController {
    session: Arc<dyn MediaSession>,
    signaling: Arc<SignalingChannel>,
    events: EventSender,
    presentation_in_mix: bool,
    started: bool,
    acknowledged: bool,
    connection: Option<MediaConnectionState>,
    pending_candidates: Vec<(String, String)>,
}

impl NegotiationController {
    pub fn new(
        session: Arc<dyn MediaSession>,
        signaling: Arc<SignalingChannel>,
        events: EventSender,
        presentation_in_mix: bool,
    ) -> Self {
        Self {
            session,
            signaling,
            events,
            presentation_in_mix,
            started: false,
            acknowledged: false,
            connection: None,
            pending_candidates: Vec::new(),
        }
    }

    /// Run the first negotiation. Later calls are no-ops.
    pub async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!(target: "conclave.negotiation", "starting media negotiation");
        self.renegotiate().await;
    }

    /// Handle one media event, renegotiating straight away if it calls for it.
    pub async fn handle(&mut self, event: MediaEvent) {
        if self.apply(event).await {
            self.renegotiate().await;
        }
    }

    /// Start, then consume media events until the channel closes or
    /// `cancel` fires.
    ///
    /// Renegotiation requests that are already queued together are folded
    /// into a single offer.
    pub async fn run(
        mut self,
        mut media: mpsc::UnboundedReceiver<MediaEvent>,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = self.start() => {}
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = media.recv() => event,
            };
            let Some(event) = event else { break };

            let work = async {
                let mut renegotiate = self.apply(event).await;
                while let Ok(event) = media.try_recv() {
                    renegotiate |= self.apply(event).await;
                }
                if renegotiate {
                    self.renegotiate().await;
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = work => {}
            }
        }
        debug!(target: "conclave.negotiation", "negotiation controller stopped");
    }

    /// Returns whether the event asks for a new offer.
    async fn apply(&mut self, event: MediaEvent) -> bool {
        match event {
            MediaEvent::NegotiationNeeded => self.started,
            MediaEvent::IceCandidate { candidate, mid } => {
                let mid = self.session.mid_roles().stable_mid(&mid);
                self.forward_candidate(candidate, mid).await;
                false
            }
            MediaEvent::IceConnectionStateChanged(state) => {
                self.connection_changed(state).await;
                false
            }
            MediaEvent::LocalTrackAdded(role) => {
                self.events
                    .emit(ConferenceEvent::LocalTrackChanged { role, active: true });
                self.started
            }
            MediaEvent::LocalTrackRemoved(role) => {
                self.events
                    .emit(ConferenceEvent::LocalTrackChanged { role, active: false });
                self.started
            }
            MediaEvent::RemoteTrackAdded(role) => {
                self.events
                    .emit(ConferenceEvent::RemoteTrackChanged { role, active: true });
                false
            }
            MediaEvent::RemoteTrackRemoved(role) => {
                self.events
                    .emit(ConferenceEvent::RemoteTrackChanged { role, active: false });
                false
            }
        }
    }

    async fn renegotiate(&mut self) {
        match self.negotiate().await {
            Ok(()) => self.flush_candidates().await,
            Err(e) => warn!(target: "conclave.negotiation", error = %e, "negotiation failed"),
        }
    }

    async fn negotiate(&mut self) -> Result<(), ConclaveError> {
        let offer = self.session.create_offer().await?;
        let Mangled {
            description,
            credentials,
        } = mangle(&offer, &self.session.mid_roles());

        self.session.set_local_description(&description).await?;
        self.signaling.set_credentials(credentials);

        let answer = self
            .signaling
            .on_offer(&description.sdp, self.presentation_in_mix)
            .await?;
        self.session
            .set_remote_description(&SessionDescription::answer(answer))
            .await?;
        debug!(target: "conclave.negotiation", "remote answer applied");
        Ok(())
    }

    async fn forward_candidate(&mut self, candidate: String, mid: String) {
        match self.signaling.on_candidate(&candidate, &mid).await {
            Ok(()) => {}
            Err(ConclaveError::NoActiveCall) => {
                debug!(target: "conclave.negotiation", mid, "no call yet, queueing candidate");
                self.pending_candidates.push((candidate, mid));
            }
            Err(e @ (ConclaveError::UnknownUfrag(_) | ConclaveError::InvalidCandidate(_))) => {
                error!(target: "conclave.negotiation", error = %e, mid, "dropping candidate");
            }
            Err(e) => {
                warn!(target: "conclave.negotiation", error = %e, mid, "candidate submission failed");
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(target: "conclave.negotiation", count = pending.len(), "flushing queued candidates");
        }
        for (candidate, mid) in pending {
            self.forward_candidate(candidate, mid).await;
        }
    }

    async fn connection_changed(&mut self, state: IceConnectionState) {
        let mapped = MediaConnectionState::from(state);
        if self.connection != Some(mapped) {
            self.connection = Some(mapped);
            info!(target: "conclave.negotiation", ?state, "media connection changed");
            self.events.emit(ConferenceEvent::MediaConnectionChanged(mapped));
        }

        if mapped == MediaConnectionState::Connected && !self.acknowledged {
            self.acknowledged = true;
            if let Err(e) = self.signaling.on_connected().await {
                warn!(target: "conclave.negotiation", error = %e, "call acknowledgement failed");
            }
        }
    }
}
