//! In-memory collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{
    CallAnswer, CallContext, CallHandle, CandidateSubmission, ConferenceApi, EventSource,
    EventStream, TokenGrant,
};
use crate::errors::ConclaveError;
use crate::event_bus::ConferenceEventBus;
use crate::events::{ConferenceEvent, ConferenceEventListener};
use crate::media::MediaSession;
use crate::retry::RetryPolicy;
use crate::sdp::{MidRoles, SessionDescription, StableMediaId};
use crate::token::{Token, TokenStore};

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    RequestToken { display_name: String, pin: Option<String> },
    Refresh(String),
    Release(String),
    Create { offer: String, presentation_in_mix: bool },
    Update { call: String, offer: String },
    Candidate { call: String, submission: CandidateSubmission },
    Ack { call: String },
    Message(String),
}

type Script<T> = Mutex<VecDeque<Result<T, ConclaveError>>>;

/// Records every request; answers from per-operation scripts, falling back
/// to a successful default once a script runs dry.
#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<Vec<ApiCall>>,
    refresh_times: Mutex<Vec<Instant>>,
    refresh: Script<Token>,
    release: Script<()>,
    create: Script<CallAnswer>,
    update: Script<String>,
    candidate: Script<()>,
    ack: Script<()>,
}

fn next<T>(script: &Script<T>) -> Option<Result<T, ConclaveError>> {
    script.lock().unwrap().pop_front()
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refresh_times(&self) -> Vec<Instant> {
        self.refresh_times.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn script_refresh(&self, result: Result<Token, ConclaveError>) {
        self.refresh.lock().unwrap().push_back(result);
    }

    pub fn script_release(&self, result: Result<(), ConclaveError>) {
        self.release.lock().unwrap().push_back(result);
    }

    pub fn script_create(&self, result: Result<CallAnswer, ConclaveError>) {
        self.create.lock().unwrap().push_back(result);
    }

    pub fn script_update(&self, result: Result<String, ConclaveError>) {
        self.update.lock().unwrap().push_back(result);
    }

    pub fn script_candidate(&self, result: Result<(), ConclaveError>) {
        self.candidate.lock().unwrap().push_back(result);
    }

    pub fn script_ack(&self, result: Result<(), ConclaveError>) {
        self.ack.lock().unwrap().push_back(result);
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ConferenceApi for FakeApi {
    async fn request_token(
        &self,
        display_name: &str,
        pin: Option<&str>,
    ) -> Result<TokenGrant, ConclaveError> {
        self.record(ApiCall::RequestToken {
            display_name: display_name.to_string(),
            pin: pin.map(str::to_string),
        });
        Ok(TokenGrant {
            token: Token::new("granted", 120),
            participant_id: "p-self".to_string(),
            display_name: Some(display_name.to_string()),
        })
    }

    async fn refresh_token(&self, token: &Token) -> Result<Token, ConclaveError> {
        self.record(ApiCall::Refresh(token.value().to_string()));
        self.refresh_times.lock().unwrap().push(Instant::now());
        // Scripted tokens count as acquired when the response arrives.
        next(&self.refresh)
            .map(|result| result.map(|t| Token::new(t.value(), t.expires_in_secs())))
            .unwrap_or_else(|| {
                Ok(Token::new(
                    format!("{}+", token.value()),
                    token.expires_in_secs(),
                ))
            })
    }

    async fn release_token(&self, token: &Token) -> Result<(), ConclaveError> {
        self.record(ApiCall::Release(token.value().to_string()));
        next(&self.release).unwrap_or(Ok(()))
    }

    async fn create_call(
        &self,
        _context: &CallContext,
        offer: &str,
        presentation_in_mix: bool,
        _token: &Token,
    ) -> Result<CallAnswer, ConclaveError> {
        self.record(ApiCall::Create {
            offer: offer.to_string(),
            presentation_in_mix,
        });
        next(&self.create).unwrap_or_else(|| {
            Ok(CallAnswer {
                call: CallHandle("c1".to_string()),
                sdp: "answer".to_string(),
            })
        })
    }

    async fn update_call(
        &self,
        _context: &CallContext,
        call: &CallHandle,
        offer: &str,
        _token: &Token,
    ) -> Result<String, ConclaveError> {
        self.record(ApiCall::Update {
            call: call.0.clone(),
            offer: offer.to_string(),
        });
        next(&self.update).unwrap_or_else(|| Ok("updated-answer".to_string()))
    }

    async fn new_candidate(
        &self,
        _context: &CallContext,
        call: &CallHandle,
        candidate: &CandidateSubmission,
        _token: &Token,
    ) -> Result<(), ConclaveError> {
        self.record(ApiCall::Candidate {
            call: call.0.clone(),
            submission: candidate.clone(),
        });
        next(&self.candidate).unwrap_or(Ok(()))
    }

    async fn ack_call(
        &self,
        _context: &CallContext,
        call: &CallHandle,
        _token: &Token,
    ) -> Result<(), ConclaveError> {
        self.record(ApiCall::Ack {
            call: call.0.clone(),
        });
        next(&self.ack).unwrap_or(Ok(()))
    }

    async fn send_message(&self, text: &str, _token: &Token) -> Result<(), ConclaveError> {
        self.record(ApiCall::Message(text.to_string()));
        Ok(())
    }
}

/// Push source whose subscriptions are fed by the test.
///
/// Each `subscribe` takes the next queued connection; with none queued the
/// subscription fails with a transient error.
#[derive(Default)]
pub struct FakeEventSource {
    connections: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<ConferenceEvent, ConclaveError>>>>,
    tokens: Mutex<Vec<String>>,
}

impl FakeEventSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a connection and return its feeding end; dropping the sender
    /// ends the stream.
    pub fn connection(&self) -> mpsc::UnboundedSender<Result<ConferenceEvent, ConclaveError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().unwrap().push_back(rx);
        tx
    }

    /// Token values used by each subscription attempt.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSource for FakeEventSource {
    async fn subscribe(&self, token: &Token) -> Result<EventStream, ConclaveError> {
        self.tokens.lock().unwrap().push(token.value().to_string());
        let rx = self
            .connections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ConclaveError::Http("connection refused".into()))?;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// Listener that keeps every event it sees.
#[derive(Default)]
pub struct EventCapture {
    events: Mutex<Vec<ConferenceEvent>>,
}

impl EventCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ConferenceEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ConferenceEventListener for EventCapture {
    fn on_event(&self, event: ConferenceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Bus whose push side gives up at once, for tests that only care about
/// local events.
pub fn quiet_bus(store: TokenStore) -> ConferenceEventBus {
    ConferenceEventBus::spawn(
        FakeEventSource::new(),
        store,
        RetryPolicy::new(Some(1), Duration::ZERO, Duration::ZERO),
        Vec::new(),
        CancellationToken::new(),
    )
}

/// Media engine stand-in.
///
/// Offers are generated from the current role table; applying a local
/// description adopts the stable mids, as a real engine would.
pub struct FakeMediaSession {
    roles: Mutex<MidRoles>,
    offer_failures: Mutex<VecDeque<ConclaveError>>,
    local: Mutex<Vec<SessionDescription>>,
    remote: Mutex<Vec<SessionDescription>>,
    closed: AtomicBool,
}

impl FakeMediaSession {
    /// Audio on mid "0" and video on mid "1".
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            roles: Mutex::new(
                MidRoles::default()
                    .with(StableMediaId::MainAudio, "0")
                    .with(StableMediaId::MainVideo, "1"),
            ),
            offer_failures: Mutex::new(VecDeque::new()),
            local: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn fail_next_offer(&self, error: ConclaveError) {
        self.offer_failures.lock().unwrap().push_back(error);
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn offer_sdp(roles: &MidRoles) -> String {
    let mut sdp = String::from("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    let tracked: Vec<(StableMediaId, &str)> = StableMediaId::ALL
        .into_iter()
        .filter_map(|role| roles.mid_for(role).map(|mid| (role, mid)))
        .collect();
    let mids: Vec<&str> = tracked.iter().map(|(_, mid)| *mid).collect();
    sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
    for (i, (role, mid)) in tracked.iter().enumerate() {
        let kind = match role {
            StableMediaId::MainAudio => "audio 9 UDP/TLS/RTP/SAVPF 111",
            _ => "video 9 UDP/TLS/RTP/SAVPF 96",
        };
        sdp.push_str(&format!(
            "m={kind}\r\na=mid:{mid}\r\na=ice-ufrag:x{n}\r\na=ice-pwd:p{n}\r\n",
            n = i + 1
        ));
    }
    sdp
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription, ConclaveError> {
        if let Some(error) = self.offer_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(SessionDescription::offer(offer_sdp(&self.roles.lock().unwrap())))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), ConclaveError> {
        let mut roles = self.roles.lock().unwrap();
        for role in StableMediaId::ALL {
            if roles.mid_for(role).is_some() {
                *roles = roles.clone().with(role, role.as_str());
            }
        }
        self.local.lock().unwrap().push(description.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), ConclaveError> {
        self.remote.lock().unwrap().push(description.clone());
        Ok(())
    }

    fn mid_roles(&self) -> MidRoles {
        self.roles.lock().unwrap().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
