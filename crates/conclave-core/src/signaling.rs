use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::api::{CallContext, CallHandle, CandidateSubmission, ConferenceApi};
use crate::errors::ConclaveError;
use crate::sdp::{MidCredentialMap, candidate_ufrag};
use crate::token::TokenStore;

/// Whether the call resource exists on the node yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    NoCall,
    HasCall(CallHandle),
}

/// Turns negotiation steps into requests against the participant's call resource.
///
/// The first successful offer creates the call; every later offer updates
/// it. The async mutex around the state is held across the create/update
/// request, so offers are applied one at a time and a second create can
/// never race the first.
pub struct SignalingChannel {
    api: Arc<dyn ConferenceApi>,
    store: TokenStore,
    context: CallContext,
    state: Mutex<CallState>,
    credentials: RwLock<MidCredentialMap>,
}

impl SignalingChannel {
    pub fn new(api: Arc<dyn ConferenceApi>, store: TokenStore, context: CallContext) -> Self {
        Self {
            api,
            store,
            context,
            state: Mutex::new(CallState::NoCall),
            credentials: RwLock::new(MidCredentialMap::new()),
        }
    }

    pub async fn state(&self) -> CallState {
        self.state.lock().await.clone()
    }

    /// Send an (already mangled) offer and return the remote answer.
    pub async fn on_offer(
        &self,
        offer: &str,
        presentation_in_mix: bool,
    ) -> Result<String, ConclaveError> {
        let mut state = self.state.lock().await;
        let token = self.store.get();
        let existing = match &*state {
            CallState::HasCall(call) => Some(call.clone()),
            CallState::NoCall => None,
        };
        match existing {
            None => {
                let answer = self
                    .api
                    .create_call(&self.context, offer, presentation_in_mix, &token)
                    .await?;
                info!(target: "conclave.signaling", call = %answer.call, "call created");
                *state = CallState::HasCall(answer.call);
                Ok(answer.sdp)
            }
            Some(call) => {
                debug!(target: "conclave.signaling", call = %call, "updating call");
                self.api
                    .update_call(&self.context, &call, offer, &token)
                    .await
            }
        }
    }

    /// Replace the credentials used to complete trickled candidates.
    pub fn set_credentials(&self, credentials: MidCredentialMap) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credentials;
    }

    pub fn credentials(&self) -> MidCredentialMap {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submit a trickled candidate, completing it with its line's password.
    ///
    /// Candidates without a `ufrag` extension fall back to the only known
    /// credentials when the session is bundled onto a single transport.
    pub async fn on_candidate(&self, candidate: &str, mid: &str) -> Result<(), ConclaveError> {
        let call = self.active_call().await?;

        let (ufrag, pwd) = {
            let credentials = self
                .credentials
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match candidate_ufrag(candidate) {
                Some(ufrag) => {
                    let pwd = credentials
                        .get(ufrag)
                        .ok_or_else(|| ConclaveError::UnknownUfrag(ufrag.to_string()))?;
                    (ufrag.to_string(), pwd.clone())
                }
                None if credentials.len() == 1 => credentials
                    .iter()
                    .next()
                    .map(|(ufrag, pwd)| (ufrag.clone(), pwd.clone()))
                    .ok_or_else(|| ConclaveError::InvalidCandidate(candidate.to_string()))?,
                None => return Err(ConclaveError::InvalidCandidate(candidate.to_string())),
            }
        };

        let submission = CandidateSubmission {
            candidate: candidate.to_string(),
            mid: mid.to_string(),
            ufrag,
            pwd,
        };
        debug!(target: "conclave.signaling", call = %call, mid, "sending candidate");
        self.api
            .new_candidate(&self.context, &call, &submission, &self.store.get())
            .await
    }

    /// Tell the node media is flowing.
    pub async fn on_connected(&self) -> Result<(), ConclaveError> {
        let call = self.active_call().await?;
        info!(target: "conclave.signaling", call = %call, "acknowledging call");
        self.api
            .ack_call(&self.context, &call, &self.store.get())
            .await
    }

    async fn active_call(&self) -> Result<CallHandle, ConclaveError> {
        match &*self.state.lock().await {
            CallState::HasCall(call) => Ok(call.clone()),
            CallState::NoCall => Err(ConclaveError::NoActiveCall),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CallAnswer;
    use crate::testing::{ApiCall, FakeApi};
    use crate::token::Token;

    const CANDIDATE: &str =
        "candidate:1 1 udp 2122260223 192.0.2.10 54400 typ host generation 0 ufrag x1";

    fn channel(api: Arc<FakeApi>) -> SignalingChannel {
        SignalingChannel::new(
            api,
            TokenStore::new(Token::new("abc", 120)),
            CallContext::new("p1"),
        )
    }

    fn credentials(pairs: &[(&str, &str)]) -> MidCredentialMap {
        pairs
            .iter()
            .map(|(u, p)| (u.to_string(), p.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn second_offer_updates_existing_call() {
        let api = FakeApi::new();
        api.script_create(Ok(CallAnswer {
            call: CallHandle("c1".into()),
            sdp: "ansA".into(),
        }));
        api.script_update(Ok("ansB".into()));
        let channel = channel(api.clone());

        assert_eq!(channel.on_offer("offerA", true).await.unwrap(), "ansA");
        assert_eq!(
            channel.state().await,
            CallState::HasCall(CallHandle("c1".into()))
        );
        assert_eq!(channel.on_offer("offerB", true).await.unwrap(), "ansB");

        assert_eq!(
            api.calls(),
            vec![
                ApiCall::Create {
                    offer: "offerA".into(),
                    presentation_in_mix: true
                },
                ApiCall::Update {
                    call: "c1".into(),
                    offer: "offerB".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_create_stays_without_call() {
        let api = FakeApi::new();
        api.script_create(Err(ConclaveError::Http("503".into())));
        let channel = channel(api.clone());

        assert!(channel.on_offer("offerA", false).await.is_err());
        assert_eq!(channel.state().await, CallState::NoCall);

        channel.on_offer("offerA", false).await.unwrap();
        assert_eq!(api.count(|c| matches!(c, ApiCall::Create { .. })), 2);
        assert_eq!(api.count(|c| matches!(c, ApiCall::Update { .. })), 0);
    }

    #[tokio::test]
    async fn concurrent_first_offers_create_one_call() {
        let api = FakeApi::new();
        let channel = channel(api.clone());

        let (a, b) = tokio::join!(channel.on_offer("a", true), channel.on_offer("b", true));
        a.unwrap();
        b.unwrap();

        assert_eq!(api.count(|c| matches!(c, ApiCall::Create { .. })), 1);
        assert_eq!(api.count(|c| matches!(c, ApiCall::Update { .. })), 1);
    }

    #[tokio::test]
    async fn candidate_before_offer_is_rejected() {
        let api = FakeApi::new();
        let channel = channel(api.clone());
        channel.set_credentials(credentials(&[("x1", "p1")]));

        let err = channel.on_candidate(CANDIDATE, "main-audio").await.unwrap_err();
        assert_eq!(err, ConclaveError::NoActiveCall);
        assert_eq!(
            channel.on_connected().await.unwrap_err(),
            ConclaveError::NoActiveCall
        );
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn candidate_uses_latest_credentials() {
        let api = FakeApi::new();
        let channel = channel(api.clone());
        channel.on_offer("offer", true).await.unwrap();

        channel.set_credentials(credentials(&[("x1", "old")]));
        channel.set_credentials(credentials(&[("x1", "p1")]));
        channel.on_candidate(CANDIDATE, "main-audio").await.unwrap();

        let submitted = api.calls().into_iter().find_map(|c| match c {
            ApiCall::Candidate { call, submission } => Some((call, submission)),
            _ => None,
        });
        assert_eq!(
            submitted,
            Some((
                "c1".to_string(),
                CandidateSubmission {
                    candidate: CANDIDATE.into(),
                    mid: "main-audio".into(),
                    ufrag: "x1".into(),
                    pwd: "p1".into(),
                }
            ))
        );
    }

    #[tokio::test]
    async fn unknown_ufrag_is_rejected_without_request() {
        let api = FakeApi::new();
        let channel = channel(api.clone());
        channel.on_offer("offer", true).await.unwrap();
        channel.set_credentials(credentials(&[("other", "pw")]));

        let err = channel.on_candidate(CANDIDATE, "main-audio").await.unwrap_err();
        assert_eq!(err, ConclaveError::UnknownUfrag("x1".into()));
        assert_eq!(api.count(|c| matches!(c, ApiCall::Candidate { .. })), 0);
    }

    #[tokio::test]
    async fn candidate_without_ufrag_uses_bundled_credentials() {
        let api = FakeApi::new();
        let channel = channel(api.clone());
        channel.on_offer("offer", true).await.unwrap();

        let bare = "candidate:1 1 udp 2122260223 192.0.2.10 54400 typ host";
        channel.set_credentials(credentials(&[("x1", "p1"), ("x2", "p2")]));
        assert!(matches!(
            channel.on_candidate(bare, "main-audio").await,
            Err(ConclaveError::InvalidCandidate(_))
        ));

        channel.set_credentials(credentials(&[("x1", "p1")]));
        channel.on_candidate(bare, "main-audio").await.unwrap();
        assert_eq!(api.count(|c| matches!(c, ApiCall::Candidate { .. })), 1);
    }

    #[tokio::test]
    async fn connected_acks_active_call() {
        let api = FakeApi::new();
        let channel = channel(api.clone());
        channel.on_offer("offer", false).await.unwrap();
        channel.on_connected().await.unwrap();
        assert_eq!(api.count(|c| *c == ApiCall::Ack { call: "c1".into() }), 1);
    }
}
