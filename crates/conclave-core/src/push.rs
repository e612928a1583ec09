//! Server-sent event stream from the node.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Event, EventSource as RawEventSource};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::api::{EventSource, EventStream};
use crate::errors::ConclaveError;
use crate::events::{
    ChatMessage, ConferenceEvent, FeccAction, FeccCommand, FeccMovement, ParticipantInfo,
};
use crate::token::Token;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct PresentationStart {
    #[serde(default)]
    presenter_name: String,
    #[serde(default)]
    presenter_uri: String,
}

#[derive(Debug, Deserialize)]
struct MessageReceived {
    #[serde(default)]
    origin: String,
    #[serde(default)]
    uuid: String,
    #[serde(rename = "type", default = "default_mime_type")]
    mime_type: String,
    payload: String,
}

fn default_mime_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Deserialize)]
struct Disconnect {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    conference_alias: String,
    #[serde(default)]
    remote_display_name: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct IncomingCancelled {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Fecc {
    action: String,
    #[serde(default)]
    movement: Vec<FeccMovementPayload>,
    #[serde(default)]
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct FeccMovementPayload {
    axis: String,
    direction: String,
}

#[derive(Debug, Deserialize)]
struct Participant {
    uuid: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    is_muted: Option<String>,
    #[serde(default)]
    is_presenting: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParticipantDelete {
    uuid: String,
}

/// The node encodes flags as "YES"/"NO".
fn flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("yes"))
}

impl From<Participant> for ParticipantInfo {
    fn from(p: Participant) -> Self {
        ParticipantInfo {
            id: p.uuid,
            display_name: p.display_name,
            uri: p.uri.filter(|uri| !uri.is_empty()),
            is_muted: flag(p.is_muted.as_deref()),
            is_presenting: flag(p.is_presenting.as_deref()),
        }
    }
}

fn payload<T: DeserializeOwned>(name: &str, data: &str) -> Result<T, ConclaveError> {
    serde_json::from_str(data)
        .map_err(|e| ConclaveError::Protocol(format!("malformed '{name}' event: {e}")))
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Decode one pushed event.
///
/// Returns `Ok(None)` for event names this client does not handle.
pub fn decode_event(name: &str, data: &str) -> Result<Option<ConferenceEvent>, ConclaveError> {
    let event = match name {
        "presentation_start" => {
            let p: PresentationStart = payload(name, data)?;
            ConferenceEvent::PresentationStart {
                presenter_name: p.presenter_name,
                presenter_uri: p.presenter_uri,
            }
        }
        "presentation_stop" => ConferenceEvent::PresentationStop,
        "message_received" => {
            let m: MessageReceived = payload(name, data)?;
            ConferenceEvent::MessageReceived(ChatMessage {
                id: Uuid::new_v4().to_string(),
                sender_id: m.uuid,
                sender_name: m.origin,
                mime_type: m.mime_type,
                text: m.payload,
                timestamp_ms: now_ms(),
            })
        }
        "disconnect" => {
            let d: Disconnect = payload(name, data)?;
            ConferenceEvent::Disconnect { reason: d.reason }
        }
        "bye" => ConferenceEvent::Bye,
        "incoming" => {
            let i: Incoming = payload(name, data)?;
            ConferenceEvent::IncomingCall {
                conference_alias: i.conference_alias,
                remote_display_name: i.remote_display_name,
                token: i.token,
            }
        }
        "incoming_cancelled" => {
            let i: IncomingCancelled = payload(name, data)?;
            ConferenceEvent::IncomingCancelled { token: i.token }
        }
        "fecc" => {
            let f: Fecc = payload(name, data)?;
            let action = match f.action.as_str() {
                "start" => FeccAction::Start,
                "continue" => FeccAction::Continue,
                "stop" => FeccAction::Stop,
                other => {
                    return Err(ConclaveError::Protocol(format!(
                        "unknown fecc action '{other}'"
                    )));
                }
            };
            ConferenceEvent::CameraControl(FeccCommand {
                action,
                movements: f
                    .movement
                    .into_iter()
                    .map(|m| FeccMovement {
                        axis: m.axis,
                        direction: m.direction,
                    })
                    .collect(),
                timeout_ms: f.timeout,
            })
        }
        "participant_create" => {
            ConferenceEvent::ParticipantJoined(payload::<Participant>(name, data)?.into())
        }
        "participant_update" => {
            ConferenceEvent::ParticipantUpdated(payload::<Participant>(name, data)?.into())
        }
        "participant_delete" => {
            ConferenceEvent::ParticipantLeft(payload::<ParticipantDelete>(name, data)?.uuid)
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn stream_error(error: reqwest_eventsource::Error) -> ConclaveError {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => match status.as_u16() {
            401 | 403 => ConclaveError::InvalidToken,
            code if code >= 500 => ConclaveError::Http(format!("event stream returned {status}")),
            _ => ConclaveError::Protocol(format!("event stream returned {status}")),
        },
        reqwest_eventsource::Error::InvalidContentType(content_type, _) => {
            ConclaveError::Protocol(format!("event stream content type {content_type:?}"))
        }
        other => ConclaveError::Http(other.to_string()),
    }
}

/// `EventSource` backed by the node's `events` endpoint.
///
/// The library's own reconnection is disabled; the event bus decides when
/// and with which token to subscribe again.
#[derive(Debug, Clone)]
pub struct SseEventSource {
    client: reqwest::Client,
    url: Url,
}

impl SseEventSource {
    /// `conference` is the conference base URL, as built by
    /// [`conference_url`](crate::http::conference_url).
    pub fn new(conference: &Url) -> Result<Self, ConclaveError> {
        let url = conference
            .join("events")
            .map_err(|e| ConclaveError::Config(format!("invalid events url: {e}")))?;
        // No overall timeout: the response body is the long-lived stream.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConclaveError::Http(format!("failed to build http client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn subscribe(&self, token: &Token) -> Result<EventStream, ConclaveError> {
        let request = self
            .client
            .get(self.url.clone())
            .header("token", token.value());
        let mut source =
            RawEventSource::new(request).map_err(|e| ConclaveError::Http(e.to_string()))?;
        source.set_retry_policy(Box::new(Never));

        match source.next().await {
            Some(Ok(Event::Open)) => {
                info!(target: "conclave.push", url = %self.url, "event stream opened");
            }
            Some(Ok(Event::Message(message))) => {
                source.close();
                return Err(ConclaveError::Protocol(format!(
                    "event '{}' before stream opened",
                    message.event
                )));
            }
            Some(Err(e)) => {
                source.close();
                return Err(stream_error(e));
            }
            None => return Err(ConclaveError::Http("event stream closed".into())),
        }

        let events = futures_util::stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Some(Ok(Event::Open)) => {}
                    Some(Ok(Event::Message(message))) => {
                        match decode_event(&message.event, &message.data) {
                            Ok(Some(event)) => return Some((Ok(event), Some(source))),
                            Ok(None) => debug!(
                                target: "conclave.push",
                                event = %message.event,
                                "ignoring unhandled event"
                            ),
                            Err(e) => warn!(
                                target: "conclave.push",
                                error = %e,
                                "skipping malformed event"
                            ),
                        }
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                        source.close();
                        return None;
                    }
                    Some(Err(e)) => {
                        source.close();
                        return Some((Err(stream_error(e)), None));
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::http::conference_url;

    #[test]
    fn presentation_and_control_events() {
        assert_eq!(
            decode_event(
                "presentation_start",
                r#"{"presenter_name":"Alice","presenter_uri":"sip:alice@example.com"}"#
            )
            .unwrap(),
            Some(ConferenceEvent::PresentationStart {
                presenter_name: "Alice".into(),
                presenter_uri: "sip:alice@example.com".into(),
            })
        );
        assert_eq!(
            decode_event("presentation_stop", "").unwrap(),
            Some(ConferenceEvent::PresentationStop)
        );
        assert_eq!(decode_event("bye", "null").unwrap(), Some(ConferenceEvent::Bye));
        assert_eq!(
            decode_event("disconnect", r#"{"reason":"Call disconnected"}"#).unwrap(),
            Some(ConferenceEvent::Disconnect {
                reason: "Call disconnected".into()
            })
        );
    }

    #[test]
    fn message_received_becomes_chat_message() {
        let event = decode_event(
            "message_received",
            r#"{"origin":"Bob","uuid":"p2","type":"text/plain","payload":"hi"}"#,
        )
        .unwrap();
        let Some(ConferenceEvent::MessageReceived(message)) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(message.sender_name, "Bob");
        assert_eq!(message.sender_id, "p2");
        assert_eq!(message.mime_type, "text/plain");
        assert_eq!(message.text, "hi");
        assert!(Uuid::parse_str(&message.id).is_ok());
    }

    #[test]
    fn incoming_call_events() {
        assert_eq!(
            decode_event(
                "incoming",
                r#"{"conference_alias":"meet","remote_display_name":"Carol","token":"t1"}"#
            )
            .unwrap(),
            Some(ConferenceEvent::IncomingCall {
                conference_alias: "meet".into(),
                remote_display_name: "Carol".into(),
                token: "t1".into(),
            })
        );
        assert_eq!(
            decode_event("incoming_cancelled", r#"{"token":"t1"}"#).unwrap(),
            Some(ConferenceEvent::IncomingCancelled { token: "t1".into() })
        );
    }

    #[test]
    fn fecc_command() {
        let event = decode_event(
            "fecc",
            r#"{"action":"start","movement":[{"axis":"pan","direction":"left"}],"timeout":1000}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(ConferenceEvent::CameraControl(FeccCommand {
                action: FeccAction::Start,
                movements: vec![FeccMovement {
                    axis: "pan".into(),
                    direction: "left".into()
                }],
                timeout_ms: 1000,
            }))
        );
        assert!(decode_event("fecc", r#"{"action":"spin"}"#).is_err());
    }

    #[test]
    fn participant_events() {
        assert_eq!(
            decode_event(
                "participant_create",
                r#"{"uuid":"p2","display_name":"Bob","uri":"","is_muted":"YES","is_presenting":"NO"}"#
            )
            .unwrap(),
            Some(ConferenceEvent::ParticipantJoined(ParticipantInfo {
                id: "p2".into(),
                display_name: "Bob".into(),
                uri: None,
                is_muted: true,
                is_presenting: false,
            }))
        );
        assert!(matches!(
            decode_event("participant_update", r#"{"uuid":"p2"}"#).unwrap(),
            Some(ConferenceEvent::ParticipantUpdated(_))
        ));
        assert_eq!(
            decode_event("participant_delete", r#"{"uuid":"p2"}"#).unwrap(),
            Some(ConferenceEvent::ParticipantLeft("p2".into()))
        );
    }

    #[test]
    fn unknown_and_malformed_events() {
        assert_eq!(decode_event("stage", "{}").unwrap(), None);
        assert!(matches!(
            decode_event("participant_delete", "{"),
            Err(ConclaveError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn subscription_yields_decoded_events_then_ends() {
        let server = MockServer::start().await;
        let body = "event: presentation_stop\ndata: null\n\n\
                    event: layout\ndata: {}\n\n\
                    event: participant_delete\ndata: {\n\n\
                    event: bye\ndata: null\n\n";
        Mock::given(method("GET"))
            .and(path("/api/client/v2/conferences/meet/events"))
            .and(header("token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let source = SseEventSource::new(&conference_url(&server.uri(), "meet").unwrap()).unwrap();
        let stream = source.subscribe(&Token::new("abc", 120)).await.unwrap();
        let events: Vec<_> = stream.collect().await;

        assert_eq!(
            events,
            vec![Ok(ConferenceEvent::PresentationStop), Ok(ConferenceEvent::Bye)]
        );
    }

    #[tokio::test]
    async fn rejected_subscription_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let source = SseEventSource::new(&conference_url(&server.uri(), "meet").unwrap()).unwrap();
        let result = source.subscribe(&Token::new("abc", 120)).await;
        assert!(matches!(result, Err(ConclaveError::InvalidToken)));
    }
}
