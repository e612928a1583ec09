//! A joined conference session and everything it runs in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{CallContext, ConferenceApi, EventSource};
use crate::chat::ChatService;
use crate::config::ConferenceConfig;
use crate::errors::ConclaveError;
use crate::event_bus::ConferenceEventBus;
use crate::events::{ChatMessage, ConferenceEvent, ConferenceEventListener, ParticipantInfo};
use crate::http::HttpConferenceApi;
use crate::lifecycle::{FailureCallback, TokenLifecycleManager};
use crate::media::{MediaEvent, MediaSession};
use crate::negotiation::NegotiationController;
use crate::push::SseEventSource;
use crate::retry::RetryPolicy;
use crate::signaling::SignalingChannel;
use crate::token::{Token, TokenStore};

/// Tunables for a session started with [`Conference::start`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Ask the node to mix the presentation into the main video.
    pub presentation_in_main: bool,
    pub refresh: RetryPolicy,
    pub reconnect: RetryPolicy,
    /// Registered before the event subscription starts, so they see every
    /// pushed event, including the initial roster.
    pub listeners: Vec<Arc<dyn ConferenceEventListener>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            presentation_in_main: true,
            refresh: RetryPolicy::default(),
            reconnect: RetryPolicy::unbounded(
                crate::retry::DEFAULT_INITIAL_BACKOFF,
                crate::retry::DEFAULT_MAX_BACKOFF,
            ),
            listeners: Vec::new(),
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("presentation_in_main", &self.presentation_in_main)
            .field("refresh", &self.refresh)
            .field("reconnect", &self.reconnect)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl From<&ConferenceConfig> for SessionOptions {
    fn from(config: &ConferenceConfig) -> Self {
        Self {
            presentation_in_main: config.presentation_in_main,
            refresh: config.refresh_policy(),
            reconnect: config.reconnect_policy(),
            listeners: Vec::new(),
        }
    }
}

struct AttachedMedia {
    session: Arc<dyn MediaSession>,
    task: JoinHandle<()>,
}

/// One participant's session in a conference.
///
/// Starting a session spawns token renewal and the event subscription;
/// attaching media adds a negotiation task. [`leave`](Self::leave) stops all
/// of them and releases the token. Dropping without leaving stops the tasks
/// but does not release the token.
pub struct Conference {
    api: Arc<dyn ConferenceApi>,
    store: TokenStore,
    context: CallContext,
    presentation_in_main: bool,
    cancel: CancellationToken,
    bus: ConferenceEventBus,
    lifecycle: TokenLifecycleManager,
    chat: ChatService,
    media: Mutex<Option<AttachedMedia>>,
    left: AtomicBool,
}

impl Conference {
    /// Start a session for an already granted token.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        api: Arc<dyn ConferenceApi>,
        source: Arc<dyn EventSource>,
        token: Token,
        context: CallContext,
        options: SessionOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let store = TokenStore::new(token);

        let bus = ConferenceEventBus::spawn(
            source,
            store.clone(),
            options.reconnect,
            options.listeners,
            cancel.child_token(),
        );

        let failures = bus.sender();
        let on_failure: FailureCallback =
            Arc::new(move |e: ConclaveError| failures.emit(ConferenceEvent::TokenRefreshFailed(e)));
        let lifecycle = TokenLifecycleManager::new(
            api.clone(),
            store.clone(),
            options.refresh,
            cancel.child_token(),
            on_failure,
        );
        lifecycle.start();

        let chat = ChatService::new(api.clone(), store.clone(), bus.sender(), &context);

        info!(
            target: "conclave.session",
            participant = %context.participant_id,
            "session started"
        );

        Self {
            api,
            store,
            context,
            presentation_in_main: options.presentation_in_main,
            cancel,
            bus,
            lifecycle,
            chat,
            media: Mutex::new(None),
            left: AtomicBool::new(false),
        }
    }

    /// Request a token from the configured node and start a session with it.
    pub async fn join(
        config: &ConferenceConfig,
        pin: Option<&str>,
    ) -> Result<Self, ConclaveError> {
        Self::join_with_listeners(config, pin, Vec::new()).await
    }

    /// Like [`join`](Self::join), with `listeners` in place before the first
    /// pushed event.
    pub async fn join_with_listeners(
        config: &ConferenceConfig,
        pin: Option<&str>,
        listeners: Vec<Arc<dyn ConferenceEventListener>>,
    ) -> Result<Self, ConclaveError> {
        config.validate()?;
        let api = Arc::new(HttpConferenceApi::new(
            &config.node_url,
            &config.conference_alias,
            config.http_timeout(),
        )?);
        let source = Arc::new(SseEventSource::new(api.base_url())?);

        info!(
            target: "conclave.session",
            conference = %config.conference_alias,
            "joining conference"
        );
        let grant = api.request_token(&config.display_name, pin).await?;
        let context = CallContext {
            participant_id: grant.participant_id,
            display_name: grant
                .display_name
                .or_else(|| Some(config.display_name.clone())),
        };

        Ok(Self::start(
            api,
            source,
            grant.token,
            context,
            SessionOptions {
                listeners,
                ..SessionOptions::from(config)
            },
        ))
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    pub fn is_active(&self) -> bool {
        !self.left.load(Ordering::SeqCst)
    }

    pub fn register_event_listener(&self, listener: Arc<dyn ConferenceEventListener>) {
        self.bus.register(listener);
    }

    pub fn unregister_event_listener(&self, listener: &Arc<dyn ConferenceEventListener>) {
        self.bus.unregister(listener);
    }

    pub async fn send_message(&self, text: &str) -> Result<ChatMessage, ConclaveError> {
        self.ensure_active()?;
        self.chat.send_message(text).await
    }

    /// Hand a media session to the conference and start negotiating it.
    ///
    /// `events` carries the engine's notifications for `session`. Only one
    /// media session can be attached.
    pub fn attach_media(
        &self,
        session: Arc<dyn MediaSession>,
        events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Result<(), ConclaveError> {
        self.ensure_active()?;
        let mut media = self.media.lock().unwrap_or_else(PoisonError::into_inner);
        if media.is_some() {
            return Err(ConclaveError::Media("media already attached".into()));
        }

        let signaling = Arc::new(SignalingChannel::new(
            self.api.clone(),
            self.store.clone(),
            self.context.clone(),
        ));
        let controller = NegotiationController::new(
            session.clone(),
            signaling,
            self.bus.sender(),
            self.presentation_in_main,
        );
        let task = tokio::spawn(controller.run(events, self.cancel.child_token()));
        info!(target: "conclave.session", "media attached");

        *media = Some(AttachedMedia { session, task });
        Ok(())
    }

    /// Current roster, reflecting every event delivered so far.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.bus.participants().await
    }

    /// Tear the session down: stop negotiation, renewal and the event
    /// stream, close media and release the token. Only the first call does
    /// anything.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "conclave.session", "leaving conference");
        self.cancel.cancel();

        let media = self
            .media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(AttachedMedia { session, task }) = media {
            if let Err(e) = task.await {
                debug!(target: "conclave.session", error = %e, "negotiation task ended abnormally");
            }
            session.close().await;
        }

        self.lifecycle.dispose().await;
        self.bus.shutdown().await;
        info!(target: "conclave.session", "left conference");
    }

    fn ensure_active(&self) -> Result<(), ConclaveError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ConclaveError::Closed)
        }
    }
}

impl Drop for Conference {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
