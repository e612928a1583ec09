//! Conclave core: client-side session engine for a REST-signalled
//! video conferencing node.
//!
//! Keeps the session token alive, negotiates media through the node's call
//! resource, and delivers pushed and locally generated events to listeners
//! in arrival order. The media engine itself stays outside this crate,
//! behind [`MediaSession`].

pub mod api;
pub mod chat;
pub mod conference;
pub mod config;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod media;
pub mod negotiation;
pub mod participants;
pub mod push;
pub mod retry;
pub mod sdp;
pub mod signaling;
pub mod token;

#[cfg(test)]
mod testing;

pub use api::{CallContext, CallHandle, ConferenceApi, EventSource};
pub use conference::{Conference, SessionOptions};
pub use config::{ConferenceConfig, RetryConfig};
pub use errors::ConclaveError;
pub use events::{ConferenceEvent, ConferenceEventListener};
pub use media::{MediaEvent, MediaSession};
pub use retry::RetryPolicy;
pub use token::{Token, TokenStore};
