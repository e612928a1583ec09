//! Ordered delivery of session events.
//!
//! Everything that reaches listeners goes through one unbounded queue
//! drained by a single task: events forwarded from the push stream, events
//! emitted locally, and listener registration changes. Queue order is
//! delivery order, and the listener set and roster are only ever touched by
//! the draining task.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::EventSource;
use crate::events::{ConferenceEvent, ConferenceEventListener, ParticipantInfo};
use crate::participants::Roster;
use crate::retry::RetryPolicy;
use crate::token::TokenStore;

enum BusCommand {
    Deliver(ConferenceEvent),
    Register(Arc<dyn ConferenceEventListener>),
    Unregister(Arc<dyn ConferenceEventListener>),
    Participants(oneshot::Sender<Vec<ParticipantInfo>>),
    Flush(oneshot::Sender<()>),
}

/// Handle for emitting locally generated events into the bus.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl EventSender {
    pub fn emit(&self, event: ConferenceEvent) {
        if self.tx.send(BusCommand::Deliver(event)).is_err() {
            debug!(target: "conclave.events", "event bus closed, dropping event");
        }
    }
}

/// Listener set owned by the delivery task.
#[derive(Default)]
struct Listeners {
    listeners: Vec<Arc<dyn ConferenceEventListener>>,
}

fn same_listener(a: &Arc<dyn ConferenceEventListener>, b: &Arc<dyn ConferenceEventListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Listeners {
    fn add(&mut self, listener: Arc<dyn ConferenceEventListener>) {
        if !self.listeners.iter().any(|l| same_listener(l, &listener)) {
            self.listeners.push(listener);
        }
    }

    fn remove(&mut self, listener: &Arc<dyn ConferenceEventListener>) {
        self.listeners.retain(|l| !same_listener(l, listener));
    }

    fn emit(&self, event: &ConferenceEvent) {
        for listener in &self.listeners {
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_event(event.clone())
            }));
            if delivered.is_err() {
                error!(target: "conclave.events", ?event, "listener panicked");
            }
        }
    }
}

pub struct ConferenceEventBus {
    tx: mpsc::UnboundedSender<BusCommand>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConferenceEventBus {
    /// Start delivery and the push subscription.
    ///
    /// `listeners` are in place before the subscription starts, so they see
    /// the first pushed events. The subscription uses the token current at
    /// each (re)connect and is retried per `reconnect` until `cancel` fires
    /// or the node says `bye`.
    pub fn spawn(
        source: Arc<dyn EventSource>,
        store: TokenStore,
        reconnect: RetryPolicy,
        listeners: Vec<Arc<dyn ConferenceEventListener>>,
        cancel: CancellationToken,
    ) -> Self {
        let mut initial = Listeners::default();
        for listener in listeners {
            initial.add(listener);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = tokio::spawn(delivery_loop(rx, initial, cancel.clone()));
        let push = tokio::spawn(push_loop(
            source,
            store,
            reconnect,
            EventSender { tx: tx.clone() },
            cancel.clone(),
        ));
        Self {
            tx,
            cancel,
            tasks: Mutex::new(vec![delivery, push]),
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn register(&self, listener: Arc<dyn ConferenceEventListener>) {
        let _ = self.tx.send(BusCommand::Register(listener));
    }

    pub fn unregister(&self, listener: &Arc<dyn ConferenceEventListener>) {
        let _ = self.tx.send(BusCommand::Unregister(listener.clone()));
    }

    /// Roster as of every event queued before this call.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(BusCommand::Participants(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Wait until everything queued before this call has been delivered.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(BusCommand::Flush(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the subscription and deliver whatever is already queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(target: "conclave.events", error = %e, "event bus task ended abnormally");
            }
        }
    }
}

async fn delivery_loop(
    mut rx: mpsc::UnboundedReceiver<BusCommand>,
    mut listeners: Listeners,
    cancel: CancellationToken,
) {
    let mut roster = Roster::new();

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => command,
        };
        match command {
            Some(command) => handle(command, &mut listeners, &mut roster),
            None => break,
        }
    }

    while let Ok(command) = rx.try_recv() {
        handle(command, &mut listeners, &mut roster);
    }
    debug!(target: "conclave.events", "event delivery stopped");
}

fn handle(command: BusCommand, listeners: &mut Listeners, roster: &mut Roster) {
    match command {
        BusCommand::Deliver(event) => {
            roster.apply(&event);
            listeners.emit(&event);
        }
        BusCommand::Register(listener) => listeners.add(listener),
        BusCommand::Unregister(listener) => listeners.remove(&listener),
        BusCommand::Participants(reply) => {
            let _ = reply.send(roster.participants().to_vec());
        }
        BusCommand::Flush(reply) => {
            let _ = reply.send(());
        }
    }
}

async fn push_loop(
    source: Arc<dyn EventSource>,
    store: TokenStore,
    policy: RetryPolicy,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut tokens = store.subscribe();
    let mut failures: u32 = 0;

    loop {
        let token = tokens.borrow_and_update().clone();
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            subscribed = source.subscribe(&token) => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                info!(target: "conclave.events", "event stream connected");
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            // Only a stream that delivers counts as recovered.
                            failures = 0;
                            let bye = event == ConferenceEvent::Bye;
                            events.emit(event);
                            if bye {
                                info!(target: "conclave.events", "node said bye, closing event stream");
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(target: "conclave.events", error = %e, "event stream failed");
                            break;
                        }
                        None => {
                            debug!(target: "conclave.events", "event stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(target: "conclave.events", error = %e, "event stream subscription failed");
            }
        }

        failures += 1;
        if !policy.should_retry(failures) {
            warn!(target: "conclave.events", attempts = failures, "giving up on event stream");
            return;
        }
        events.emit(ConferenceEvent::EventStreamReconnecting { attempt: failures });

        // A renewed token is worth trying straight away.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(policy.backoff(failures)) => {}
            Ok(()) = tokens.changed() => {}
        }
    }
}
